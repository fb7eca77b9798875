#![forbid(unsafe_code)]

//! Policy-as-data runtime configuration.
//!
//! ```toml
//! unhandled_commands = "warn"
//! changeset_capacity = 64
//! trace_passes = true
//! ```
//!
//! Every field is optional; missing fields take their defaults. Unknown
//! fields are rejected so typos surface at load time.

use std::path::Path;

use scanflow_core::DEFAULT_LEDGER_CAPACITY;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// What the router does with a command no router in the chain handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnhandledCommandPolicy {
    /// Drop silently.
    Ignore,
    /// Drop and emit a DEBUG event.
    #[default]
    Debug,
    /// Drop and emit a WARN event.
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub unhandled_commands: UnhandledCommandPolicy,
    /// Ledger bound for containers built from this config.
    pub changeset_capacity: usize,
    /// Emit a TRACE event per observer invocation.
    pub trace_passes: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            unhandled_commands: UnhandledCommandPolicy::default(),
            changeset_capacity: DEFAULT_LEDGER_CAPACITY,
            trace_passes: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RuntimeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
