#![forbid(unsafe_code)]

//! Dependency-ordered observer scheduling.
//!
//! # Design
//!
//! Observers form a bipartite graph over containers: observer `X` must run
//! before observer `Y` whenever `X` modifies a container `Y` observes. The
//! scheduler keeps a cached linear order consistent with every such edge
//! and walks it once per [`notify_observers`] call.
//!
//! Observers live in a generational arena. [`ObserverId`] carries the slot
//! generation, and removing an observer bumps it, so a removed id can never
//! resolve again. A pass resolves each id of its precomputed order right
//! before invoking it, which is what keeps an observer deleted earlier in
//! the same pass (for example by another observer's body) from firing.
//!
//! # Sorting
//!
//! Kahn-style, worst case quadratic, fine for the tens of observers a UI
//! carries:
//!
//! 1. `pending` = all live observers in registration order; `unsatisfied` =
//!    count of pending writers per container.
//! 2. Place the first pending observer none of whose observed containers
//!    has a pending writer; release its writes.
//! 3. Repeat until nothing is placeable. Anything still pending sits on or
//!    behind a cycle, which is reported as [`RuntimeError::DependencyCycle`].
//!
//! Adding or removing observers only marks the order dirty. The sort runs at
//! the start of the next pass, never during one.
//!
//! # Invariants
//!
//! 1. For every edge (X modifies C, Y observes C) X precedes Y in the order.
//! 2. Each observer is invoked at most once per pass.
//! 3. An observer removed before or during a pass is never invoked again.
//! 4. A cyclic graph never yields a partial order: every pass fails until
//!    the wiring is fixed.
//!
//! [`notify_observers`]: ObserverScheduler::notify_observers

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use scanflow_core::{AnyContainer, ContainerId};
use web_time::Instant;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::observer::Observer;

/// Generational handle to an observer registered in a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{}v{}", self.index, self.generation)
    }
}

/// Counters for one notification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Observers whose body ran.
    pub ran: usize,
    /// Observers visited with nothing observed changed.
    pub unchanged: usize,
    /// Entries of the order skipped because their observer was removed.
    pub removed: usize,
    /// Whether the order was recomputed at the start of this pass.
    pub resorted: bool,
}

struct Slot {
    generation: u32,
    name: Rc<str>,
    observer: Option<Rc<RefCell<Observer>>>,
}

struct Node {
    id: ObserverId,
    name: Rc<str>,
    observed: Vec<ContainerId>,
    modified: Vec<ContainerId>,
}

struct SchedulerInner {
    slots: RefCell<Vec<Slot>>,
    free: RefCell<Vec<u32>>,
    /// Live ids in registration order; ties in the sort break by this.
    registration: RefCell<Vec<ObserverId>>,
    order: RefCell<Vec<ObserverId>>,
    dirty: Cell<bool>,
    in_pass: Cell<bool>,
    trace_passes: bool,
}

/// Shared handle to an observer scheduler. Cloning yields the same
/// scheduler.
#[derive(Clone)]
pub struct ObserverScheduler {
    inner: Rc<SchedulerInner>,
}

/// Non-owning scheduler handle for observer bodies that add or remove
/// observers, so the scheduler does not keep itself alive.
#[derive(Clone)]
pub struct WeakObserverScheduler {
    inner: Weak<SchedulerInner>,
}

impl WeakObserverScheduler {
    #[must_use]
    pub fn upgrade(&self) -> Option<ObserverScheduler> {
        self.inner.upgrade().map(|inner| ObserverScheduler { inner })
    }
}

impl fmt::Debug for WeakObserverScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakObserverScheduler")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

struct PassGuard<'a>(&'a Cell<bool>);

impl<'a> PassGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Default for ObserverScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObserverScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverScheduler")
            .field("observers", &self.len())
            .field("dirty", &self.is_dirty())
            .field("in_pass", &self.inner.in_pass.get())
            .finish()
    }
}

impl ObserverScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&RuntimeConfig::default())
    }

    #[must_use]
    pub fn with_config(config: &RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                slots: RefCell::new(Vec::new()),
                free: RefCell::new(Vec::new()),
                registration: RefCell::new(Vec::new()),
                order: RefCell::new(Vec::new()),
                dirty: Cell::new(false),
                in_pass: Cell::new(false),
                trace_passes: config.trace_passes,
            }),
        }
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakObserverScheduler {
        WeakObserverScheduler {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Register an observer. It joins the order at the next pass.
    pub fn add(&self, observer: Observer) -> ObserverId {
        let name: Rc<str> = Rc::from(observer.name());
        let observer = Some(Rc::new(RefCell::new(observer)));
        let mut slots = self.inner.slots.borrow_mut();
        let id = match self.inner.free.borrow_mut().pop() {
            Some(index) => {
                let slot = &mut slots[index as usize];
                slot.name = name;
                slot.observer = observer;
                ObserverId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(slots.len()).unwrap_or(u32::MAX);
                slots.push(Slot {
                    generation: 0,
                    name,
                    observer,
                });
                ObserverId {
                    index,
                    generation: 0,
                }
            }
        };
        drop(slots);
        self.inner.registration.borrow_mut().push(id);
        self.inner.dirty.set(true);
        id
    }

    /// Remove an observer. Returns `false` for ids already removed.
    ///
    /// Safe to call from inside an observer body: the removed observer is
    /// skipped for the rest of the running pass.
    pub fn remove(&self, id: ObserverId) -> bool {
        let removed = {
            let mut slots = self.inner.slots.borrow_mut();
            let Some(slot) = slots
                .get_mut(id.index as usize)
                .filter(|slot| slot.generation == id.generation && slot.observer.is_some())
            else {
                return false;
            };
            slot.generation = slot.generation.wrapping_add(1);
            slot.observer.take()
        };
        self.inner.free.borrow_mut().push(id.index);
        self.inner.registration.borrow_mut().retain(|live| *live != id);
        self.inner.dirty.set(true);
        tracing::trace!(message = "scheduler.remove", observer = %id);
        // Dropped outside the slot borrow; the body may own scheduler handles.
        drop(removed);
        true
    }

    #[must_use]
    pub fn contains(&self, id: ObserverId) -> bool {
        self.resolve(id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.registration.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the order will be recomputed at the next pass.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.get()
    }

    /// Observer names in execution order.
    ///
    /// Sorts first when dirty, unless called from inside a pass, where the
    /// order of the running pass is reported as is.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        if self.inner.dirty.get() && !self.inner.in_pass.get() {
            self.sort()?;
        }
        let order = self.inner.order.borrow();
        let slots = self.inner.slots.borrow();
        Ok(order
            .iter()
            .filter_map(|id| {
                slots
                    .get(id.index as usize)
                    .filter(|slot| slot.generation == id.generation && slot.observer.is_some())
                    .map(|slot| slot.name.to_string())
            })
            .collect())
    }

    /// Run one notification pass.
    ///
    /// Re-sorts if observers were added or removed since the last pass, then
    /// calls [`Observer::update`] on each live observer in order. The first
    /// observer error aborts the pass and propagates; containers already
    /// bumped during the pass stay bumped.
    pub fn notify_observers(&self) -> Result<PassReport> {
        if self.inner.in_pass.get() {
            return Err(RuntimeError::ReentrantPass);
        }
        let resorted = self.inner.dirty.get();
        if resorted {
            self.sort()?;
        }
        let _guard = PassGuard::enter(&self.inner.in_pass);
        let order = self.inner.order.borrow().clone();

        let span = tracing::debug_span!(
            "scheduler.pass",
            observers = order.len(),
            ran = tracing::field::Empty,
            skipped = tracing::field::Empty
        );
        let _entered = span.enter();

        let mut report = PassReport {
            resorted,
            ..PassReport::default()
        };
        for id in order {
            let Some(observer) = self.resolve(id) else {
                report.removed += 1;
                continue;
            };
            let ran = observer.borrow_mut().update()?;
            if self.inner.trace_passes {
                tracing::trace!(message = "scheduler.invoke", observer = %id, ran);
            }
            if ran {
                report.ran += 1;
            } else {
                report.unchanged += 1;
            }
        }
        span.record("ran", report.ran);
        span.record("skipped", report.unchanged + report.removed);
        Ok(report)
    }

    fn resolve(&self, id: ObserverId) -> Option<Rc<RefCell<Observer>>> {
        let slots = self.inner.slots.borrow();
        let slot = slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.observer.clone()
    }

    fn collect_nodes(&self) -> Vec<Node> {
        let registration = self.inner.registration.borrow();
        let slots = self.inner.slots.borrow();
        let mut nodes = Vec::with_capacity(registration.len());
        for id in registration.iter().copied() {
            let Some(slot) = slots.get(id.index as usize) else {
                continue;
            };
            let Some(observer) = slot.observer.as_ref() else {
                continue;
            };
            let observer = observer.borrow();
            let mut modified: Vec<ContainerId> =
                observer.modified().iter().map(AnyContainer::id).collect();
            modified.sort_unstable();
            modified.dedup();
            nodes.push(Node {
                id,
                name: Rc::clone(&slot.name),
                observed: observer.observed().iter().map(AnyContainer::id).collect(),
                modified,
            });
        }
        nodes
    }

    fn sort(&self) -> Result<()> {
        let started = Instant::now();
        let mut pending = self.collect_nodes();
        let total = pending.len();

        let mut unsatisfied: AHashMap<ContainerId, usize> = AHashMap::new();
        for node in &pending {
            for container in &node.modified {
                *unsatisfied.entry(*container).or_default() += 1;
            }
        }

        let mut order = Vec::with_capacity(total);
        while let Some(pos) = pending.iter().position(|node| {
            node.observed
                .iter()
                .all(|container| !unsatisfied.contains_key(container))
        }) {
            let node = pending.remove(pos);
            for container in &node.modified {
                if let Some(writers) = unsatisfied.get_mut(container) {
                    *writers -= 1;
                    if *writers == 0 {
                        unsatisfied.remove(container);
                    }
                }
            }
            order.push(node.id);
        }

        if !pending.is_empty() {
            let observers: Vec<String> = pending.iter().map(|node| node.name.to_string()).collect();
            tracing::error!(message = "scheduler.cycle", observers = ?observers);
            return Err(RuntimeError::DependencyCycle { observers });
        }

        *self.inner.order.borrow_mut() = order;
        self.inner.dirty.set(false);
        tracing::debug!(
            message = "scheduler.sort",
            observers = total,
            elapsed_us = started.elapsed().as_micros() as u64
        );
        Ok(())
    }
}
