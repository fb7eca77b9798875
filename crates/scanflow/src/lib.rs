#![forbid(unsafe_code)]

//! Scanflow public facade crate.
//!
//! Versioned state containers, command routing, and dependency-ordered
//! observers for single-threaded interactive front ends.

pub use scanflow_core as core;
pub use scanflow_runtime as runtime;

pub use scanflow_core::{
    AnyContainer, Changeset, Container, ContainerBuilder, ContainerId, ContainerRegistry,
    CoreError, StateDocument, Updater,
};
pub use scanflow_runtime::{
    Command, CommandRouter, Dispatched, Observer, ObserverId, ObserverScheduler, PassReport,
    RuntimeConfig, RuntimeError, UnhandledCommandPolicy, UpdateCx,
};

pub mod prelude {
    pub use scanflow_core as core;
    pub use scanflow_runtime as runtime;

    pub use scanflow_core::{Changeset, Container, ContainerRegistry};
    pub use scanflow_runtime::{Command, CommandRouter, Observer, ObserverScheduler};
}
