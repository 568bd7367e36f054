use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::LogFormat;
use crate::error::{AppError, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "taskflow=info,taskflow_cli=info";

/// Install the global subscriber. Logs go to stderr so results on stdout stay parseable.
///
/// An explicit `level` wins over `RUST_LOG`, which wins over the default.
pub fn init_logging(level: Option<&str>, format: LogFormat) -> Result<()> {
    let filter = match level {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|e| AppError::Logging(format!("invalid log level '{directive}': {e}")))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    result.map_err(|e| AppError::Logging(format!("failed to set global subscriber: {e}")))
}
