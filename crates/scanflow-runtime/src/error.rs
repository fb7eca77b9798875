use std::path::PathBuf;

use thiserror::Error;

/// Error type observer bodies may return.
pub type BoxError = Box<dyn std::error::Error + 'static>;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Observers whose reads and writes form a cycle. This is a wiring bug;
    /// every pass fails until the offending observers are removed.
    #[error("observer dependency cycle among: {}", observers.join(", "))]
    DependencyCycle { observers: Vec<String> },

    #[error("notify_observers called from inside an observer update")]
    ReentrantPass,

    #[error("observer `{name}` failed: {source}")]
    Observer {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid runtime config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    /// Whether this error indicates a wiring bug rather than a runtime
    /// condition.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DependencyCycle { .. } | Self::ReentrantPass)
    }
}
