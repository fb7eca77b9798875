#![forbid(unsafe_code)]

//! Registry of live containers.
//!
//! Every live container is tracked by its [`ContainerId`]; that set drives
//! enumeration and persistence. Typed lookup is a second index keyed by the
//! container's full type (`Container<T, C>`), so [`ContainerRegistry::get`]
//! hands back an already-typed handle. Both indexes hold only weak
//! references: containers unregister themselves when their last handle
//! drops, and a registry torn down first simply stops answering lookups.
//!
//! One container per type is the expected shape for typed lookup. A second
//! container of the same type takes over the typed slot (last-write-wins,
//! logged at WARN) but stays registered, listed and persisted.
//!
//! A persisted container that drops while the registry is alive leaves its
//! last state behind; [`ContainerRegistry::save_document`] still writes it
//! unless a live container claims the same key.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use serde_json::Value;

use crate::changeset::Changeset;
use crate::container::{AnyContainer, Container, ContainerId, ErasedContainer, Inner};
use crate::error::{CoreError, Result};
use crate::persist::StateDocument;

struct TypedSlot {
    id: ContainerId,
    name: &'static str,
    /// `Weak<Inner<T, C>>` for the slot's key type.
    typed: Box<dyn Any>,
}

pub(crate) struct RegistryInner {
    live: RefCell<AHashMap<ContainerId, Weak<dyn ErasedContainer>>>,
    typed: RefCell<AHashMap<TypeId, TypedSlot>>,
    /// Last state of persisted containers that were torn down.
    retained: RefCell<StateDocument>,
}

impl RegistryInner {
    /// Unregister container `id`, and drop the typed slot for `key` if it
    /// still belongs to it.
    pub(crate) fn remove(&self, key: TypeId, id: ContainerId) {
        // A failed borrow leaves a dead entry behind, which lookups ignore.
        if let Ok(mut live) = self.live.try_borrow_mut() {
            live.remove(&id);
        }
        let Ok(mut typed) = self.typed.try_borrow_mut() else {
            return;
        };
        if typed.get(&key).is_some_and(|slot| slot.id == id) {
            typed.remove(&key);
        }
    }

    /// Keep the final state of a persisted container for the next save.
    pub(crate) fn retain(&self, key: &str, value: Value) {
        match self.retained.try_borrow_mut() {
            Ok(mut retained) => {
                retained.insert(key, value);
                tracing::debug!(message = "registry.retain", key);
            }
            Err(_) => tracing::warn!(message = "registry.retain_failed", key),
        }
    }
}

/// Owner of the set of live containers.
pub struct ContainerRegistry {
    inner: Rc<RegistryInner>,
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("live", &self.len())
            .field("retained", &self.inner.retained.borrow().len())
            .finish()
    }
}

impl ContainerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RegistryInner {
                live: RefCell::new(AHashMap::new()),
                typed: RefCell::new(AHashMap::new()),
                retained: RefCell::new(StateDocument::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn insert<T: 'static, C: Changeset>(&self, inner: &Rc<Inner<T, C>>) {
        let erased: Rc<dyn ErasedContainer> = inner.clone();
        let id = inner.id();

        if let Some(key) = erased.persist_key() {
            let clash = self
                .persisted()
                .into_iter()
                .find(|other| other.persist_key() == Some(key));
            if let Some(other) = clash {
                tracing::warn!(
                    message = "registry.duplicate_persist_key",
                    key,
                    existing = other.id().raw(),
                    container = id.raw()
                );
            }
        }

        self.inner
            .live
            .borrow_mut()
            .insert(id, Rc::downgrade(&erased));

        let slot = TypedSlot {
            id,
            name: erased.name(),
            typed: Box::new(Rc::downgrade(inner)),
        };
        let key = TypeId::of::<Container<T, C>>();
        let previous = self.inner.typed.borrow_mut().insert(key, slot);
        if let Some(previous) = previous.filter(|slot| self.is_live(slot.id)) {
            tracing::warn!(
                message = "registry.duplicate_type",
                replaced = previous.id.raw(),
                replaced_name = previous.name,
                container = id.raw()
            );
        }
    }

    fn is_live(&self, id: ContainerId) -> bool {
        self.inner
            .live
            .borrow()
            .get(&id)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Look up the most recently registered live container of type
    /// `Container<T, C>`.
    #[must_use]
    pub fn get<T: 'static, C: Changeset>(&self) -> Option<Container<T, C>> {
        let typed = self.inner.typed.borrow();
        let slot = typed.get(&TypeId::of::<Container<T, C>>())?;
        let weak = slot.typed.downcast_ref::<Weak<Inner<T, C>>>()?;
        weak.upgrade().map(Container::from_inner)
    }

    #[must_use]
    pub fn contains<T: 'static, C: Changeset>(&self) -> bool {
        self.get::<T, C>().is_some()
    }

    /// Number of live containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .live
            .borrow()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Erased handles to every live container, ordered by creation.
    #[must_use]
    pub fn containers(&self) -> Vec<AnyContainer> {
        let mut live: Vec<AnyContainer> = self
            .inner
            .live
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .map(AnyContainer::from_erased)
            .collect();
        live.sort_by_key(AnyContainer::id);
        live
    }

    fn persisted(&self) -> Vec<AnyContainer> {
        self.containers()
            .into_iter()
            .filter(|c| c.persist_key().is_some())
            .collect()
    }

    /// Load one document entry into the live container persisted under
    /// `key`. When several share the key, each of them is loaded.
    ///
    /// Each load runs as a single updater scope: one version bump and a
    /// full-reload changeset.
    pub fn load_entry(&self, key: &str, value: Value) -> Result<()> {
        let targets: Vec<AnyContainer> = self
            .persisted()
            .into_iter()
            .filter(|c| c.persist_key() == Some(key))
            .collect();
        if targets.is_empty() {
            return Err(CoreError::UnknownPersistKey {
                key: key.to_owned(),
            });
        }
        for target in targets {
            target.load_value(value.clone())?;
        }
        Ok(())
    }

    /// Load every entry of `document` whose key matches a persisted
    /// container. Entries without a live container are left alone.
    ///
    /// Returns the number of containers loaded.
    pub fn load_document(&self, document: &StateDocument) -> Result<usize> {
        let mut loaded = 0;
        for container in self.persisted() {
            let Some(key) = container.persist_key() else {
                continue;
            };
            if let Some(value) = document.get(key) {
                container.load_value(value.clone())?;
                loaded += 1;
            }
        }
        tracing::debug!(message = "registry.load", loaded, entries = document.len());
        Ok(loaded)
    }

    /// Serialize every persisted container into a fresh document.
    ///
    /// Live containers are written over the retained state of torn-down
    /// ones; among live containers sharing a key, the newest wins.
    pub fn save_document(&self) -> Result<StateDocument> {
        let mut document = self.inner.retained.borrow().clone();
        for container in self.persisted() {
            let (Some(key), Some(value)) = (container.persist_key(), container.save_value())
            else {
                continue;
            };
            document.insert(key, value?);
        }
        Ok(document)
    }
}
