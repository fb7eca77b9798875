#![forbid(unsafe_code)]

//! Versioned containers and their scoped updaters.
//!
//! # Design
//!
//! [`Container<T, C>`] wraps a state value in shared, reference-counted
//! storage together with a version counter and an optional
//! [`ChangesetLedger`]. Cloning a `Container` creates a new handle to the
//! **same** state.
//!
//! All mutation goes through an [`Updater`], which borrows the state
//! exclusively. Dropping the updater commits the scope: the version advances
//! by exactly one and the accumulated changeset (if tracked) is pushed.
//!
//! # Failure Modes
//!
//! - **Mutation fails mid-scope**: the commit still happens on drop, so a
//!   partially applied scope is indistinguishable, version-wise, from a
//!   successful one. Observers are level-triggered and re-read state, so
//!   they see whatever the scope managed to write.
//! - **Nested updaters on one container**: the second `updater()` call panics
//!   on the `RefCell` borrow. Callers must not nest scopes.

use std::any::{TypeId, type_name};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::changeset::{Changeset, ChangesetLedger, DEFAULT_LEDGER_CAPACITY};
use crate::error::{CoreError, Result};
use crate::registry::{ContainerRegistry, RegistryInner};

/// Version every container starts at.
pub const INITIAL_VERSION: u64 = 1;

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);

impl ContainerId {
    fn next() -> Self {
        Self(NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

struct Persistence<T> {
    key: String,
    save: fn(&T) -> serde_json::Result<Value>,
    load: fn(Value) -> serde_json::Result<T>,
}

pub(crate) struct Inner<T, C> {
    id: ContainerId,
    name: &'static str,
    /// Registry slot key, captured so `Drop` needs no `'static` bound.
    slot_key: TypeId,
    state: RefCell<T>,
    version: Cell<u64>,
    ledger: Option<RefCell<ChangesetLedger<C>>>,
    persist: Option<Persistence<T>>,
    registry: Weak<RegistryInner>,
}

impl<T, C> Inner<T, C> {
    pub(crate) fn id(&self) -> ContainerId {
        self.id
    }
}

impl<T, C> Drop for Inner<T, C> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        registry.remove(self.slot_key, self.id);
        let Some(persist) = self.persist.as_ref() else {
            return;
        };
        match (persist.save)(self.state.get_mut()) {
            Ok(value) => registry.retain(&persist.key, value),
            Err(err) => tracing::warn!(
                message = "container.save_on_drop_failed",
                key = %persist.key,
                error = %err
            ),
        }
    }
}

/// Type-erased view of a container used by observers and the registry.
pub(crate) trait ErasedContainer {
    fn id(&self) -> ContainerId;
    fn version(&self) -> u64;
    fn name(&self) -> &'static str;
    fn persist_key(&self) -> Option<&str>;
    fn save_value(&self) -> Option<Result<Value>>;
    fn load_value(&self, value: Value) -> Result<()>;
}

impl<T: 'static, C: Changeset> ErasedContainer for Inner<T, C> {
    fn id(&self) -> ContainerId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version.get()
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn persist_key(&self) -> Option<&str> {
        self.persist.as_ref().map(|p| p.key.as_str())
    }

    fn save_value(&self) -> Option<Result<Value>> {
        let persist = self.persist.as_ref()?;
        let state = self.state.borrow();
        Some((persist.save)(&state).map_err(|source| CoreError::Serialize {
            key: persist.key.clone(),
            source,
        }))
    }

    fn load_value(&self, value: Value) -> Result<()> {
        let Some(persist) = self.persist.as_ref() else {
            return Ok(());
        };
        // Decode before opening a scope: a rejected document is not a mutation.
        let loaded = (persist.load)(value).map_err(|source| CoreError::Deserialize {
            key: persist.key.clone(),
            source,
        })?;
        let mut updater = Updater::open(self);
        *updater = loaded;
        *updater.changes() = C::full_reload();
        Ok(())
    }
}

/// A shared, versioned unit of observable state.
///
/// `C` is the changeset type recorded per updater scope; containers that do
/// not need incremental updates use the default `()`.
///
/// # Example
///
/// ```
/// use scanflow_core::{Container, ContainerRegistry};
///
/// let registry = ContainerRegistry::new();
/// let dpi: Container<u32> = Container::new(&registry, 300);
/// assert_eq!(dpi.version(), 1);
///
/// {
///     let mut dpi_mut = dpi.updater();
///     *dpi_mut = 600;
///     *dpi_mut += 0;
/// }
/// assert_eq!(dpi.version(), 2);
/// assert_eq!(*dpi.read(), 600);
/// ```
pub struct Container<T, C = ()> {
    inner: Rc<Inner<T, C>>,
}

impl<T, C> Clone for Container<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug, C> fmt::Debug for Container<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Container");
        s.field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("version", &self.inner.version.get());
        match self.inner.state.try_borrow() {
            Ok(state) => s.field("state", &*state),
            Err(_) => s.field("state", &"<updating>"),
        };
        s.finish()
    }
}

impl<T: 'static, C: Changeset> Container<T, C> {
    /// Create and register a container without changeset tracking or
    /// persistence.
    #[must_use]
    pub fn new(registry: &ContainerRegistry, state: T) -> Self {
        ContainerBuilder::new(state).register(registry)
    }

    /// Start building a container with tracking or persistence options.
    #[must_use]
    pub fn builder(state: T) -> ContainerBuilder<T, C> {
        ContainerBuilder::new(state)
    }

    #[must_use]
    pub fn id(&self) -> ContainerId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Current version. Starts at [`INITIAL_VERSION`], +1 per committed scope.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    /// Borrow the current state.
    ///
    /// # Panics
    ///
    /// Panics if an [`Updater`] for this container is alive.
    #[must_use]
    pub fn read(&self) -> Ref<'_, T> {
        self.inner.state.borrow()
    }

    /// Access the current state by reference.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.state.borrow())
    }

    /// Open a mutation scope. The version advances when the updater drops.
    ///
    /// # Panics
    ///
    /// Panics if another updater (or a `read()` borrow) for this container
    /// is alive.
    #[must_use = "dropping the updater immediately still commits a version bump"]
    pub fn updater(&self) -> Updater<'_, T, C> {
        Updater::open(&self.inner)
    }

    /// Run `f` inside one mutation scope and return its result.
    ///
    /// The commit happens even when `f` returns an error value.
    pub fn update<R>(&self, f: impl FnOnce(&mut T, &mut C) -> R) -> R {
        let mut updater = self.updater();
        let Updater { state, changes, .. } = &mut updater;
        f(state, changes)
    }

    /// Replace the whole state in one scope, flagging a full reload.
    pub fn replace(&self, value: T) -> T {
        let mut updater = self.updater();
        *updater.changes() = C::full_reload();
        std::mem::replace(&mut *updater, value)
    }

    /// Whether this container records a changeset per scope.
    #[must_use]
    pub fn tracks_changesets(&self) -> bool {
        self.inner.ledger.is_some()
    }

    /// Aggregate of everything that changed after `from_version`.
    ///
    /// Empty when `from_version` is the current version. Containers without
    /// a ledger report [`Changeset::full_reload`] for any older version.
    #[must_use]
    pub fn changes_since(&self, from_version: u64) -> C {
        if from_version == self.version() {
            return C::default();
        }
        match &self.inner.ledger {
            Some(ledger) => ledger.borrow().aggregated_since(from_version),
            None => C::full_reload(),
        }
    }

    /// Run `f` against the ledger, if this container tracks one.
    pub fn with_ledger<R>(&self, f: impl FnOnce(&ChangesetLedger<C>) -> R) -> Option<R> {
        self.inner.ledger.as_ref().map(|ledger| f(&ledger.borrow()))
    }

    /// Drop ledger entries every consumer has already caught up past.
    pub fn discard_changes_before(&self, version: u64) {
        if let Some(ledger) = &self.inner.ledger {
            ledger.borrow_mut().discard_before(version);
        }
    }

    /// Persistence key; `None` when the container is not persisted.
    #[must_use]
    pub fn persist_key(&self) -> Option<&str> {
        self.inner.persist.as_ref().map(|p| p.key.as_str())
    }

    /// Type-erased handle for dependency declarations.
    #[must_use]
    pub fn erased(&self) -> AnyContainer {
        AnyContainer::from(self)
    }

    /// Whether two handles point at the same container.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn from_inner(inner: Rc<Inner<T, C>>) -> Self {
        Self { inner }
    }
}

/// Builder for containers with changeset tracking or persistence.
pub struct ContainerBuilder<T, C = ()> {
    state: T,
    name: &'static str,
    ledger_capacity: Option<usize>,
    persist: Option<Persistence<T>>,
    _changeset: PhantomData<fn() -> C>,
}

impl<T: 'static, C: Changeset> ContainerBuilder<T, C> {
    #[must_use]
    pub fn new(state: T) -> Self {
        Self {
            state,
            name: type_name::<T>(),
            ledger_capacity: None,
            persist: None,
            _changeset: PhantomData,
        }
    }

    /// Human-readable name used in logs and cycle reports.
    #[must_use]
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Record a changeset per scope, keeping [`DEFAULT_LEDGER_CAPACITY`] entries.
    #[must_use]
    pub fn track_changesets(self) -> Self {
        self.changeset_capacity(DEFAULT_LEDGER_CAPACITY)
    }

    /// Record a changeset per scope, keeping at most `capacity` entries.
    #[must_use]
    pub fn changeset_capacity(mut self, capacity: usize) -> Self {
        self.ledger_capacity = Some(capacity);
        self
    }

    /// Create the container and register it into `registry`.
    pub fn register(self, registry: &ContainerRegistry) -> Container<T, C> {
        let inner = Rc::new(Inner {
            id: ContainerId::next(),
            name: self.name,
            slot_key: TypeId::of::<Container<T, C>>(),
            state: RefCell::new(self.state),
            version: Cell::new(INITIAL_VERSION),
            ledger: self
                .ledger_capacity
                .map(|capacity| RefCell::new(ChangesetLedger::new(INITIAL_VERSION, capacity))),
            persist: self.persist,
            registry: registry.downgrade(),
        });
        registry.insert(&inner);
        Container::from_inner(inner)
    }
}

impl<T: Serialize + DeserializeOwned + 'static, C: Changeset> ContainerBuilder<T, C> {
    /// Persist this container under `key`. An empty key disables persistence.
    #[must_use]
    pub fn persist(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.persist = (!key.is_empty()).then(|| Persistence {
            key,
            save: |state: &T| serde_json::to_value(state),
            load: serde_json::from_value::<T>,
        });
        self
    }
}

/// Exclusive mutation scope over one container.
///
/// Derefs to the state. Dropping it commits exactly one version bump,
/// including on the unwinding path.
pub struct Updater<'a, T, C: Changeset> {
    inner: &'a Inner<T, C>,
    state: RefMut<'a, T>,
    changes: C,
}

impl<'a, T, C: Changeset> Updater<'a, T, C> {
    fn open(inner: &'a Inner<T, C>) -> Self {
        Self {
            inner,
            state: inner.state.borrow_mut(),
            changes: C::default(),
        }
    }

    /// The changeset this scope will push on commit.
    pub fn changes(&mut self) -> &mut C {
        &mut self.changes
    }

    /// Version the container had when this scope opened.
    #[must_use]
    pub fn base_version(&self) -> u64 {
        self.inner.version.get()
    }
}

impl<T, C: Changeset> Deref for Updater<'_, T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state
    }
}

impl<T, C: Changeset> DerefMut for Updater<'_, T, C> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.state
    }
}

impl<T, C: Changeset> Drop for Updater<'_, T, C> {
    fn drop(&mut self) {
        let inner = self.inner;
        let begins_at = inner.version.get();
        let version = begins_at + 1;
        inner.version.set(version);
        let pushed = match &inner.ledger {
            Some(ledger) => {
                ledger
                    .borrow_mut()
                    .push(begins_at, std::mem::take(&mut self.changes));
                true
            }
            None => false,
        };
        tracing::trace!(
            message = "container.commit",
            container = inner.id.raw(),
            name = inner.name,
            version,
            changeset = pushed
        );
    }
}

/// Type-erased container handle: identity and version only.
#[derive(Clone)]
pub struct AnyContainer {
    inner: Rc<dyn ErasedContainer>,
}

impl AnyContainer {
    pub(crate) fn from_erased(inner: Rc<dyn ErasedContainer>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> ContainerId {
        self.inner.id()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version()
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    #[must_use]
    pub fn persist_key(&self) -> Option<&str> {
        self.inner.persist_key()
    }

    pub(crate) fn save_value(&self) -> Option<Result<Value>> {
        self.inner.save_value()
    }

    pub(crate) fn load_value(&self, value: Value) -> Result<()> {
        self.inner.load_value(value)
    }
}

impl fmt::Debug for AnyContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyContainer")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("version", &self.version())
            .finish()
    }
}

impl<T: 'static, C: Changeset> From<&Container<T, C>> for AnyContainer {
    fn from(container: &Container<T, C>) -> Self {
        let erased: Rc<dyn ErasedContainer> = container.inner.clone();
        Self::from_erased(erased)
    }
}

impl<T: 'static, C: Changeset> From<Container<T, C>> for AnyContainer {
    fn from(container: Container<T, C>) -> Self {
        Self::from(&container)
    }
}
