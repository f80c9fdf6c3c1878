//! Diagnostic logging setup. Progress lines meant for the user are printed by
//! the CLI directly; everything else goes through `tracing`.

use anyhow::{anyhow, Result};
use tracing::Span;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_keyword(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_directive`.
pub fn init_logging(format: LogFormat, default_directive: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|error| anyhow!("invalid log filter '{default_directive}': {error}"))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|error| anyhow!("failed to install log subscriber: {error}"))
}

/// Span attached to everything a background job logs.
pub fn job_span(job_id: &str, operation: &str) -> Span {
    tracing::info_span!("job", job_id = %job_id, operation = %operation)
}
