use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fraud_ledger_core::LedgerError;

/// Row count of the store as of the last successful training run, kept as a
/// single base-10 line.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns 0 when no watermark has been written or the file is unreadable.
    #[must_use]
    pub fn read(&self) -> u64 {
        let body = match fs::read_to_string(&self.path) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => return 0,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "watermark unreadable; treating as 0"
                );
                return 0;
            }
        };

        match body.trim().parse::<u64>() {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    content = body.trim(),
                    error = %err,
                    "watermark corrupt; treating as 0"
                );
                0
            }
        }
    }

    /// Replaces the stored value through a synced temp file and a rename.
    ///
    /// # Errors
    /// Returns [`LedgerError::WatermarkIo`] when the temp file cannot be
    /// written or renamed. The previous value stays in place.
    pub fn write(&self, value: u64) -> Result<(), LedgerError> {
        let temp_path = self.temp_path();
        let written = write_synced(&temp_path, &format!("{value}\n"))
            .and_then(|()| fs::rename(&temp_path, &self.path));

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(LedgerError::WatermarkIo(format!(
                "failed to write watermark {}: {err}",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|value| value.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn write_synced(path: &Path, body: &str) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(body.as_bytes())?;
    file.sync_all()
}
