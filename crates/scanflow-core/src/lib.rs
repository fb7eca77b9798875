#![forbid(unsafe_code)]

//! Core: versioned state containers, scoped updaters, changeset ledgers, and
//! the typed container registry.
//!
//! # Architecture
//!
//! A [`Container<T, C>`] is a shared, single-threaded handle to one unit of
//! observable state. Mutation always goes through an [`Updater`], whose drop
//! commits exactly one version bump (and, when the container tracks
//! changesets, pushes the accumulated [`Changeset`] into its
//! [`ChangesetLedger`]).
//!
//! Containers register themselves into a [`ContainerRegistry`] at
//! construction and unregister when their last handle drops. The registry
//! only holds weak references, so tearing it down before or after its
//! containers never dangles.
//!
//! # Invariants
//!
//! 1. Versions start at [`INITIAL_VERSION`] and increase by exactly 1 per
//!    completed updater scope, regardless of how many edits the scope made.
//! 2. The commit is unconditional: a scope that fails or unwinds still bumps.
//! 3. Ledger entries are contiguous: entry `k` covers `[k, k + 1)`.

pub mod changeset;
pub mod container;
pub mod error;
pub mod persist;
pub mod registry;

pub use changeset::{Changeset, ChangesetEntry, ChangesetLedger, DEFAULT_LEDGER_CAPACITY};
pub use container::{
    AnyContainer, Container, ContainerBuilder, ContainerId, INITIAL_VERSION, Updater,
};
pub use error::{CoreError, Result};
pub use persist::StateDocument;
pub use registry::ContainerRegistry;
