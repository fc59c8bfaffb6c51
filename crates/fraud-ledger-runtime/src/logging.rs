//! Tracing subscriber setup shared by the `fl` CLI and the prediction service.

use std::str::FromStr;

use fraud_ledger_core::LedgerError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    Pretty,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(LedgerError::Configuration(format!(
                "unknown log format {other}; expected compact, pretty or json"
            ))),
        }
    }
}

/// Installs the global subscriber. Events go to stderr so command output on
/// stdout stays machine readable. The filter comes from `RUST_LOG` and falls
/// back to `default_filter`.
///
/// # Errors
/// Returns [`LedgerError::Configuration`] when a global subscriber is already
/// installed.
pub fn init(format: LogFormat, default_filter: &str) -> Result<(), LedgerError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    result.map_err(|err| {
        LedgerError::Configuration(format!("failed to initialize tracing subscriber: {err}"))
    })
}
