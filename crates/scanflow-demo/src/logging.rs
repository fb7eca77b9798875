//! Log subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the `--log-level` flag applies to the
//! Scanflow crates and everything else stays at `warn`.

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{DemoError, Result};

/// Parse a `--log-level` value.
pub fn parse_level(value: &str) -> Result<Level> {
    value
        .parse::<Level>()
        .map_err(|_| DemoError::InvalidLogLevel {
            value: value.to_string(),
        })
}

fn build_env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,scanflow_core={level},scanflow_runtime={level},scanflow_demo={level}",
            level = level.as_str().to_lowercase()
        ))
    })
}

/// Install a compact stderr subscriber for the process.
pub fn init_logging(level: Level) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_env_filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| DemoError::Logging {
            message: err.to_string(),
        })
}
