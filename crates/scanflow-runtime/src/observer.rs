#![forbid(unsafe_code)]

//! Observers: reactive units with declared read/write dependencies.
//!
//! An [`Observer`] lists the containers it reads ("observed") and the ones
//! it writes ("modified"), and keeps the last version it saw of each
//! observed container. [`Observer::update`] runs the body only when at least
//! one observed version moved.
//!
//! # Invariants
//!
//! 1. `last_seen.len() == observed.len()`; entries start at 0, below every
//!    real version, so the first update always runs the body.
//! 2. The body runs at most once per `update()`, however many observed
//!    containers changed (level-triggered, not edge-counting).
//! 3. After a successful `update()` every last-seen version equals the
//!    container's current version, whether or not the body ran.
//!
//! # Failure Modes
//!
//! - **Body returns an error**: the error propagates and last-seen versions
//!   are left untouched, so the next `update()` retries.

use std::fmt;

use scanflow_core::{AnyContainer, ContainerId};

use crate::error::{BoxError, Result, RuntimeError};

type Body = Box<dyn FnMut(&UpdateCx<'_>) -> std::result::Result<(), BoxError>>;

/// What an observer body can ask about the pass that triggered it.
pub struct UpdateCx<'a> {
    observed: &'a [AnyContainer],
    last_seen: &'a [u64],
}

impl UpdateCx<'_> {
    /// Version of `container` the observer saw on its previous run, or
    /// `None` if the container is not observed.
    ///
    /// Feed this to `Container::changes_since` for incremental updates.
    #[must_use]
    pub fn last_seen(&self, container: impl Into<ContainerKey>) -> Option<u64> {
        let id = container.into().0;
        self.observed
            .iter()
            .position(|c| c.id() == id)
            .map(|i| self.last_seen[i])
    }

    /// Whether `container` moved since the previous run.
    #[must_use]
    pub fn changed(&self, container: impl Into<ContainerKey>) -> bool {
        let id = container.into().0;
        self.observed
            .iter()
            .zip(self.last_seen)
            .any(|(c, seen)| c.id() == id && c.version() != *seen)
    }

    /// Whether this is the observer's first run.
    #[must_use]
    pub fn is_first_run(&self) -> bool {
        self.last_seen.iter().all(|seen| *seen == 0)
    }
}

/// Anything that identifies a container for [`UpdateCx`] queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerKey(ContainerId);

impl From<ContainerId> for ContainerKey {
    fn from(id: ContainerId) -> Self {
        Self(id)
    }
}

impl From<&AnyContainer> for ContainerKey {
    fn from(container: &AnyContainer) -> Self {
        Self(container.id())
    }
}

impl<T: 'static, C: scanflow_core::Changeset> From<&scanflow_core::Container<T, C>>
    for ContainerKey
{
    fn from(container: &scanflow_core::Container<T, C>) -> Self {
        Self(container.id())
    }
}

/// A unit of reactive logic over versioned containers.
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use scanflow_core::{Container, ContainerRegistry};
/// use scanflow_runtime::Observer;
///
/// let registry = ContainerRegistry::new();
/// let dpi: Container<u32> = Container::new(&registry, 300);
/// let runs = Rc::new(Cell::new(0));
///
/// let r = Rc::clone(&runs);
/// let mut observer = Observer::new("dpi-label", move |_| r.set(r.get() + 1)).observes(&dpi);
///
/// assert!(observer.update().unwrap());
/// assert!(!observer.update().unwrap());
/// dpi.update(|v, _| *v = 600);
/// assert!(observer.update().unwrap());
/// assert_eq!(runs.get(), 2);
/// ```
pub struct Observer {
    name: String,
    observed: Vec<AnyContainer>,
    modified: Vec<AnyContainer>,
    last_seen: Vec<u64>,
    body: Body,
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("name", &self.name)
            .field("observed", &self.observed)
            .field("modified", &self.modified)
            .field("last_seen", &self.last_seen)
            .finish_non_exhaustive()
    }
}

impl Observer {
    /// Observer with an infallible body.
    #[must_use]
    pub fn new(name: impl Into<String>, mut body: impl FnMut(&UpdateCx<'_>) + 'static) -> Self {
        Self::try_new(name, move |cx| {
            body(cx);
            Ok(())
        })
    }

    /// Observer whose body may fail; failures propagate out of the pass.
    #[must_use]
    pub fn try_new(
        name: impl Into<String>,
        body: impl FnMut(&UpdateCx<'_>) -> std::result::Result<(), BoxError> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            observed: Vec::new(),
            modified: Vec::new(),
            last_seen: Vec::new(),
            body: Box::new(body),
        }
    }

    /// Declare a container this observer reads.
    #[must_use]
    pub fn observes(mut self, container: impl Into<AnyContainer>) -> Self {
        self.observed.push(container.into());
        self.last_seen.push(0);
        self
    }

    /// Declare a container this observer writes.
    #[must_use]
    pub fn modifies(mut self, container: impl Into<AnyContainer>) -> Self {
        self.modified.push(container.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn observed(&self) -> &[AnyContainer] {
        &self.observed
    }

    #[must_use]
    pub fn modified(&self) -> &[AnyContainer] {
        &self.modified
    }

    /// Last-seen version per observed container, in declaration order.
    #[must_use]
    pub fn last_seen(&self) -> &[u64] {
        &self.last_seen
    }

    /// Whether any observed container moved since the last run.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.observed
            .iter()
            .zip(&self.last_seen)
            .any(|(c, seen)| c.version() != *seen)
    }

    /// Run the body if anything observed changed; returns whether it ran.
    pub fn update(&mut self) -> Result<bool> {
        let stale = self.is_stale();
        if stale {
            let cx = UpdateCx {
                observed: &self.observed,
                last_seen: &self.last_seen,
            };
            (self.body)(&cx).map_err(|source| RuntimeError::Observer {
                name: self.name.clone(),
                source,
            })?;
        }
        for (seen, container) in self.last_seen.iter_mut().zip(&self.observed) {
            *seen = container.version();
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanflow_core::{Changeset, Container, ContainerRegistry};
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeSet;
    use std::rc::Rc;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Lines(BTreeSet<usize>);

    impl Changeset for Lines {
        fn merge(&mut self, later: &Self) {
            self.0.extend(later.0.iter().copied());
        }

        fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        fn full_reload() -> Self {
            Self((0..4).collect())
        }
    }

    fn counter() -> (Rc<Cell<u32>>, impl FnMut(&UpdateCx<'_>) + 'static) {
        let runs = Rc::new(Cell::new(0));
        let r = Rc::clone(&runs);
        (runs, move |_: &UpdateCx<'_>| r.set(r.get() + 1))
    }

    #[test]
    fn first_update_runs_body() {
        let registry = ContainerRegistry::new();
        let c: Container<u8> = Container::new(&registry, 0);
        let (runs, body) = counter();
        let mut obs = Observer::new("first", body).observes(&c);
        assert_eq!(obs.last_seen(), &[0]);
        assert!(obs.update().expect("update"));
        assert_eq!(runs.get(), 1);
        assert_eq!(obs.last_seen(), &[1]);
    }

    #[test]
    fn unchanged_versions_skip_body() {
        let registry = ContainerRegistry::new();
        let c: Container<u8> = Container::new(&registry, 0);
        let (runs, body) = counter();
        let mut obs = Observer::new("idle", body).observes(&c);
        obs.update().expect("update");
        for _ in 0..5 {
            assert!(!obs.update().expect("update"));
        }
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn several_changes_run_body_once() {
        let registry = ContainerRegistry::new();
        let a: Container<u8> = Container::new(&registry, 0);
        let b: Container<u8> = Container::new(&registry, 0);
        let (runs, body) = counter();
        let mut obs = Observer::new("both", body).observes(&a).observes(&b);
        obs.update().expect("update");

        for _ in 0..3 {
            a.update(|v, _| *v += 1);
        }
        b.update(|v, _| *v += 1);
        assert!(obs.update().expect("update"));
        assert_eq!(runs.get(), 2);
        assert_eq!(obs.last_seen(), &[a.version(), b.version()]);
    }

    #[test]
    fn observer_without_dependencies_never_runs() {
        let (runs, body) = counter();
        let mut obs = Observer::new("orphan", body);
        assert!(!obs.update().expect("update"));
        assert_eq!(runs.get(), 0);
    }

    #[test]
    fn failing_body_propagates_and_retries() {
        let registry = ContainerRegistry::new();
        let c: Container<u8> = Container::new(&registry, 0);
        let attempts = Rc::new(Cell::new(0));
        let a = Rc::clone(&attempts);
        let mut obs = Observer::try_new("flaky", move |_| {
            a.set(a.get() + 1);
            if a.get() == 1 {
                Err("device busy".into())
            } else {
                Ok(())
            }
        })
        .observes(&c);

        let err = obs.update().expect_err("first attempt fails");
        assert!(matches!(err, RuntimeError::Observer { ref name, .. } if name == "flaky"));
        assert_eq!(obs.last_seen(), &[0], "not refreshed on failure");

        assert!(obs.update().expect("retry"));
        assert_eq!(attempts.get(), 2);
    }

    #[test]
    fn cx_reports_previous_versions_for_changesets() {
        let registry = ContainerRegistry::new();
        let rows: Container<Vec<String>, Lines> = Container::builder(vec![String::new(); 4])
            .track_changesets()
            .register(&registry);
        let applied = Rc::new(RefCell::new(Vec::new()));

        let src = rows.clone();
        let out = Rc::clone(&applied);
        let mut obs = Observer::new("rows-view", move |cx| {
            let since = cx.last_seen(&src).expect("observed");
            let changes = src.changes_since(since);
            out.borrow_mut().push(changes.0.into_iter().collect::<Vec<_>>());
        })
        .observes(&rows);

        obs.update().expect("update");
        rows.update(|r, ch| {
            r[2] = "ADF".into();
            ch.0.insert(2);
        });
        rows.update(|r, ch| {
            r[0] = "Flatbed".into();
            ch.0.insert(0);
        });
        obs.update().expect("update");

        // First run starts from version 0, before the ledger: full reload.
        assert_eq!(*applied.borrow(), vec![vec![0, 1, 2, 3], vec![0, 2]]);
    }

    #[test]
    fn cx_changed_and_first_run() {
        let registry = ContainerRegistry::new();
        let a: Container<u8> = Container::new(&registry, 0);
        let b: Container<u8> = Container::new(&registry, 0);
        let flags = Rc::new(RefCell::new(Vec::new()));

        let (ka, kb) = (a.id(), b.id());
        let f = Rc::clone(&flags);
        let mut obs = Observer::new("which", move |cx| {
            f.borrow_mut()
                .push((cx.is_first_run(), cx.changed(ka), cx.changed(kb)));
        })
        .observes(&a)
        .observes(&b);

        obs.update().expect("update");
        b.update(|v, _| *v = 1);
        obs.update().expect("update");
        assert_eq!(
            *flags.borrow(),
            vec![(true, true, true), (false, false, true)]
        );
    }

    #[test]
    fn modified_containers_are_recorded() {
        let registry = ContainerRegistry::new();
        let input: Container<u8> = Container::new(&registry, 0);
        let output: Container<u8> = Container::new(&registry, 0);
        let obs = Observer::new("copy", |_| {})
            .observes(&input)
            .modifies(&output);
        assert_eq!(obs.observed()[0].id(), input.id());
        assert_eq!(obs.modified()[0].id(), output.id());
        assert!(obs.is_stale());
        assert!(format!("{obs:?}").contains("copy"));
    }
}
