#![forbid(unsafe_code)]

//! Runtime: command routing and dependency-ordered observer scheduling.
//!
//! Data flows one way through a tick:
//!
//! ```text
//! input → Command → CommandRouter::dispatch → handler → Updater scopes
//!       → ObserverScheduler::notify_observers → observers (topological order)
//!       → views read state or aggregated changesets
//! ```
//!
//! Everything runs on one thread, cooperatively. Nothing here blocks.

pub mod command;
pub mod config;
pub mod error;
pub mod observer;
pub mod scheduler;

pub use command::{Command, CommandRouter, Dispatched};
pub use config::{RuntimeConfig, UnhandledCommandPolicy};
pub use error::{BoxError, Result, RuntimeError};
pub use observer::{ContainerKey, Observer, UpdateCx};
pub use scheduler::{ObserverId, ObserverScheduler, PassReport, WeakObserverScheduler};
