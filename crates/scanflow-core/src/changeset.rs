#![forbid(unsafe_code)]

//! Aggregable diffs recorded per updater scope.
//!
//! A container that tracks changesets pushes one [`ChangesetEntry`] per
//! committed scope into its [`ChangesetLedger`]. Consumers that last looked
//! at version `v` ask for [`ChangesetLedger::aggregated_since`] and get one
//! merged diff covering `[v, head)` instead of re-reading the full state.
//!
//! # Invariants
//!
//! 1. Entries are contiguous: each entry begins where the previous one ended.
//! 2. Merging is associative: folding `[a, b)` then `[b, c)` describes the
//!    same transition as the two entries applied in order.
//! 3. The ledger holds at most `capacity` entries. A request reaching back
//!    past the oldest retained entry yields [`Changeset::full_reload`], never
//!    a silently truncated diff.

use std::collections::VecDeque;
use std::fmt;

/// Default number of entries a ledger retains.
pub const DEFAULT_LEDGER_CAPACITY: usize = 256;

/// A diff describing what one or more updater scopes changed.
///
/// Implementations define the per-domain aggregation rule: unions of changed
/// indices, OR of category flags, last-write-wins for scalar fields.
///
/// ```
/// use std::collections::BTreeSet;
/// use scanflow_core::Changeset;
///
/// #[derive(Debug, Clone, Default, PartialEq)]
/// struct RowChanges {
///     rows: BTreeSet<usize>,
///     reload: bool,
/// }
///
/// impl Changeset for RowChanges {
///     fn merge(&mut self, later: &Self) {
///         self.rows.extend(later.rows.iter().copied());
///         self.reload |= later.reload;
///     }
///
///     fn is_empty(&self) -> bool {
///         self.rows.is_empty() && !self.reload
///     }
///
///     fn full_reload() -> Self {
///         Self { rows: BTreeSet::new(), reload: true }
///     }
/// }
/// ```
pub trait Changeset: Clone + Default + fmt::Debug + 'static {
    /// Fold a later changeset into this one.
    fn merge(&mut self, later: &Self);

    /// Whether this changeset flags no change at all.
    fn is_empty(&self) -> bool;

    /// A changeset telling consumers to discard everything they derived and
    /// rebuild from current state.
    fn full_reload() -> Self;
}

/// The "no changeset" changeset used by containers that do not track diffs.
impl Changeset for () {
    fn merge(&mut self, _later: &Self) {}

    fn is_empty(&self) -> bool {
        true
    }

    fn full_reload() -> Self {}
}

/// One recorded scope: the version it starts from and its diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetEntry<C> {
    begins_at: u64,
    diff: C,
}

impl<C> ChangesetEntry<C> {
    /// Version at which this diff begins applying.
    #[must_use]
    pub const fn begins_at(&self) -> u64 {
        self.begins_at
    }

    /// Version this diff produces.
    #[must_use]
    pub const fn produces(&self) -> u64 {
        self.begins_at + 1
    }

    #[must_use]
    pub fn diff(&self) -> &C {
        &self.diff
    }
}

/// Bounded, contiguous history of changesets for one container.
#[derive(Debug, Clone)]
pub struct ChangesetLedger<C> {
    entries: VecDeque<ChangesetEntry<C>>,
    capacity: usize,
    /// Oldest version from which an exact aggregate can still be built.
    floor: u64,
    /// Version produced by the newest entry (or the start version).
    head: u64,
}

impl<C: Changeset> ChangesetLedger<C> {
    /// Create an empty ledger for a container currently at `start_version`.
    #[must_use]
    pub fn new(start_version: u64, capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_LEDGER_CAPACITY)),
            capacity,
            floor: start_version,
            head: start_version,
        }
    }

    /// Record the diff of a scope that moved the container from `begins_at`
    /// to `begins_at + 1`.
    pub fn push(&mut self, begins_at: u64, diff: C) {
        debug_assert_eq!(
            begins_at, self.head,
            "changeset pushed out of sequence (ledger head {})",
            self.head
        );
        self.entries.push_back(ChangesetEntry { begins_at, diff });
        self.head = begins_at + 1;
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.floor = evicted.produces();
            }
        }
        if self.entries.is_empty() {
            self.floor = self.head;
        }
    }

    /// Merge every diff strictly after `from_version` up to the head.
    ///
    /// Returns an empty changeset when `from_version` is already at (or past)
    /// the head, and [`Changeset::full_reload`] when the needed entries have
    /// been evicted.
    #[must_use]
    pub fn aggregated_since(&self, from_version: u64) -> C {
        if from_version >= self.head {
            return C::default();
        }
        if from_version < self.floor {
            return C::full_reload();
        }
        let mut aggregate = C::default();
        for entry in self.entries.iter().filter(|e| e.begins_at >= from_version) {
            aggregate.merge(&entry.diff);
        }
        aggregate
    }

    /// Drop entries that end at or before `version`; later requests from
    /// before `version` will report a full reload.
    pub fn discard_before(&mut self, version: u64) {
        let version = version.min(self.head);
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.produces() <= version)
        {
            self.entries.pop_front();
        }
        self.floor = self.floor.max(version);
    }

    /// Version produced by the newest entry.
    #[must_use]
    pub const fn head(&self) -> u64 {
        self.head
    }

    /// Oldest version an exact aggregate can start from.
    #[must_use]
    pub const fn floor(&self) -> u64 {
        self.floor
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChangesetEntry<C>> {
        self.entries.iter()
    }
}
