use std::path::PathBuf;
use std::time::Duration;

use fraud_ledger_core::LedgerError;

pub const DEFAULT_QUEUE_PATH: &str = "./transactions_queue.log";
pub const DEFAULT_WATERMARK_PATH: &str = "./last_training_count.txt";
pub const DEFAULT_DATABASE_PATH: &str = "./fraud_ledger.sqlite3";
pub const DEFAULT_MODEL_PATH: &str = "./fraud_model.json";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_RETRAIN_THRESHOLD: u64 = 1_000;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// File locations shared by the worker, the orchestrator and the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPaths {
    pub queue: PathBuf,
    pub watermark: PathBuf,
    pub database: PathBuf,
    pub model: PathBuf,
}

impl Default for LedgerPaths {
    fn default() -> Self {
        Self {
            queue: PathBuf::from(DEFAULT_QUEUE_PATH),
            watermark: PathBuf::from(DEFAULT_WATERMARK_PATH),
            database: PathBuf::from(DEFAULT_DATABASE_PATH),
            model: PathBuf::from(DEFAULT_MODEL_PATH),
        }
    }
}

impl LedgerPaths {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a path is empty or the queue
    /// and watermark share a file.
    pub fn validate(&self) -> Result<(), LedgerError> {
        for (name, path) in [
            ("queue", &self.queue),
            ("watermark", &self.watermark),
            ("database", &self.database),
            ("model", &self.model),
        ] {
            if path.as_os_str().is_empty() {
                return Err(LedgerError::Configuration(format!(
                    "{name} path MUST be provided"
                )));
            }
        }

        if self.queue == self.watermark {
            return Err(LedgerError::Configuration(
                "queue and watermark MUST be different files".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Stop after this many ticks. `None` runs until shutdown is requested.
    pub max_ticks: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_ticks: None,
        }
    }
}

impl WorkerConfig {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the interval is shorter than
    /// 10 ms or `max_ticks` is zero.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.poll_interval < MIN_POLL_INTERVAL {
            return Err(LedgerError::Configuration(format!(
                "poll interval MUST be >= {} ms",
                MIN_POLL_INTERVAL.as_millis()
            )));
        }

        if self.max_ticks == Some(0) {
            return Err(LedgerError::Configuration(
                "max_ticks MUST be >= 1 when provided".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrainConfig {
    pub threshold: u64,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_RETRAIN_THRESHOLD,
        }
    }
}

impl RetrainConfig {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the threshold is zero.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.threshold == 0 {
            return Err(LedgerError::Configuration(
                "retrain threshold MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(WorkerConfig::default().validate().is_ok());
        assert!(RetrainConfig::default().validate().is_ok());
        assert_eq!(RetrainConfig::default().threshold, 1_000);
        assert!(LedgerPaths::default().validate().is_ok());
    }

    #[test]
    fn shared_queue_and_watermark_file_is_rejected() {
        let paths = LedgerPaths {
            watermark: PathBuf::from(DEFAULT_QUEUE_PATH),
            ..LedgerPaths::default()
        };
        assert!(paths.validate().is_err());
    }

    #[test]
    fn zero_threshold_and_tiny_interval_are_rejected() {
        assert!(RetrainConfig { threshold: 0 }.validate().is_err());
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(1),
            max_ticks: None,
        };
        assert!(matches!(
            config.validate(),
            Err(LedgerError::Configuration(_))
        ));
    }
}
