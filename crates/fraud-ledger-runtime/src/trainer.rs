use std::path::PathBuf;
use std::process::Command;

use fraud_ledger_core::{LedgerError, Trainer, TrainingOutcome};

/// Runs an external training program. Exit status 0 is success; the program
/// inherits stdio so its own progress output stays visible.
#[derive(Debug, Clone)]
pub struct CommandTrainer {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandTrainer {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl Trainer for CommandTrainer {
    fn trainer_name(&self) -> &str {
        "command"
    }

    fn train(&self) -> Result<TrainingOutcome, LedgerError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        tracing::info!(
            program = %self.program.display(),
            args = ?self.args,
            "starting training command"
        );
        let status = command.status().map_err(|err| {
            LedgerError::TrainingFailed(format!(
                "failed to start {}: {err}",
                self.program.display()
            ))
        })?;

        if status.success() {
            Ok(TrainingOutcome::Succeeded)
        } else {
            Ok(TrainingOutcome::Failed {
                reason: format!("{} exited with {status}", self.program.display()),
            })
        }
    }
}
