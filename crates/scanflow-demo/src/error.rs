use thiserror::Error;

use scanflow::{CoreError, RuntimeError};

pub type Result<T> = std::result::Result<T, DemoError>;

#[derive(Debug, Error)]
pub enum DemoError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("unknown device: {name}")]
    UnknownDevice { name: String },

    #[error("device offline: {name}")]
    DeviceOffline { name: String },

    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },

    #[error("failed to install log subscriber: {message}")]
    Logging { message: String },
}

impl DemoError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Runtime(err) if err.is_fatal() => 3,
            Self::Core(_) => 2,
            _ => 1,
        }
    }
}
