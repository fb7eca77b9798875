#![forbid(unsafe_code)]

//! Type-keyed command routing with parent delegation.
//!
//! # Design
//!
//! A [`Command`] is an immutable value whose type is its dispatch key. Each
//! [`CommandRouter`] maps `TypeId` tokens to slots that hold a handler
//! already typed to its command, so dispatch never guesses at payload types.
//!
//! Handlers bind their targets (container handles, views) at registration
//! time. The router itself is inert: every side effect lives in a handler.
//!
//! # Invariants
//!
//! 1. At most one handler per command type per router. Registering again
//!    replaces the previous handler, which is dropped once no dispatch of it
//!    is in flight.
//! 2. A type that was never registered falls through to the parent router.
//! 3. A type that was explicitly unregistered stops here: the parent is not
//!    consulted. This lets a child suppress a command its parent handles.
//! 4. Handlers may dispatch further commands (re-entrantly) through any
//!    router, including the one that invoked them.
//!
//! # Failure Modes
//!
//! - **No handler anywhere**: the command is dropped. [`dispatch`] returns
//!   [`Dispatched::Unhandled`] and an event is logged per
//!   [`UnhandledCommandPolicy`].
//! - **Cyclic parent chain**: delegation stops when it revisits a router.
//!
//! [`dispatch`]: CommandRouter::dispatch

use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use crate::config::{RuntimeConfig, UnhandledCommandPolicy};

/// Marker for values that can be dispatched through a [`CommandRouter`].
///
/// ```
/// use scanflow_runtime::{Command, CommandRouter};
///
/// struct SetResolution(u32);
/// impl Command for SetResolution {}
///
/// let router = CommandRouter::new();
/// router.register_handler(|cmd: &SetResolution| assert_eq!(cmd.0, 600));
/// assert!(router.dispatch(&SetResolution(600)).is_handled());
/// ```
pub trait Command: 'static {
    /// Name used in logs.
    fn command_name(&self) -> &'static str {
        type_name::<Self>()
    }
}

/// Outcome of [`CommandRouter::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A handler ran.
    Handled,
    /// No handler ran: none registered in the chain, or a router suppressed
    /// the type.
    Unhandled,
}

impl Dispatched {
    #[must_use]
    pub const fn is_handled(self) -> bool {
        matches!(self, Self::Handled)
    }
}

struct TypedHandler<C> {
    call: Box<dyn Fn(&C)>,
}

enum Slot {
    /// `Rc<TypedHandler<C>>` for the slot's command type.
    Handler(Rc<dyn Any>),
    /// Explicitly unregistered: stop here, do not ask the parent.
    Suppressed,
}

enum Lookup {
    Handler(Rc<dyn Any>),
    Suppressed,
    Missing,
}

struct RouterInner {
    table: RefCell<AHashMap<TypeId, Slot>>,
    parent: RefCell<Option<CommandRouter>>,
    unhandled: UnhandledCommandPolicy,
}

/// Shared handle to a routing table. Cloning yields the same router.
#[derive(Clone)]
pub struct CommandRouter {
    inner: Rc<RouterInner>,
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.table.borrow();
        let handlers = table
            .values()
            .filter(|slot| matches!(slot, Slot::Handler(_)))
            .count();
        f.debug_struct("CommandRouter")
            .field("handlers", &handlers)
            .field("suppressed", &(table.len() - handlers))
            .field("has_parent", &self.inner.parent.borrow().is_some())
            .finish()
    }
}

impl CommandRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&RuntimeConfig::default())
    }

    #[must_use]
    pub fn with_config(config: &RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(RouterInner {
                table: RefCell::new(AHashMap::new()),
                parent: RefCell::new(None),
                unhandled: config.unhandled_commands,
            }),
        }
    }

    /// Create a router that delegates to `self` for unregistered types.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self {
            inner: Rc::new(RouterInner {
                table: RefCell::new(AHashMap::new()),
                parent: RefCell::new(None),
                unhandled: self.inner.unhandled,
            }),
        };
        child.set_parent(Some(self));
        child
    }

    /// Replace the delegation target. A router never delegates to itself.
    pub fn set_parent(&self, parent: Option<&CommandRouter>) {
        let parent = parent.filter(|p| !p.ptr_eq(self)).cloned();
        *self.inner.parent.borrow_mut() = parent;
    }

    #[must_use]
    pub fn parent(&self) -> Option<CommandRouter> {
        self.inner.parent.borrow().clone()
    }

    /// Register `handler` for commands of type `C`.
    ///
    /// Returns `true` when a previous handler (or suppression) was replaced.
    pub fn register_handler<C: Command>(&self, handler: impl Fn(&C) + 'static) -> bool {
        let typed: Rc<dyn Any> = Rc::new(TypedHandler::<C> {
            call: Box::new(handler),
        });
        let previous = self
            .inner
            .table
            .borrow_mut()
            .insert(TypeId::of::<C>(), Slot::Handler(typed));
        // Dropped here, outside the table borrow, in case its captures
        // touch this router.
        previous.is_some()
    }

    /// Register a handler that receives `targets` alongside each command.
    ///
    /// `targets` is typically a container handle or a tuple of them:
    ///
    /// ```
    /// use scanflow_core::{Container, ContainerRegistry};
    /// use scanflow_runtime::{Command, CommandRouter};
    ///
    /// struct Rotate(u16);
    /// impl Command for Rotate {}
    ///
    /// fn rotate(cmd: &Rotate, angle: &Container<u16>) {
    ///     angle.update(|a, _| *a = (*a + cmd.0) % 360);
    /// }
    ///
    /// let registry = ContainerRegistry::new();
    /// let angle: Container<u16> = Container::new(&registry, 0);
    /// let router = CommandRouter::new();
    /// router.bind_handler(angle.clone(), rotate);
    /// router.dispatch(&Rotate(90));
    /// assert_eq!(*angle.read(), 90);
    /// ```
    pub fn bind_handler<C: Command, T: 'static>(
        &self,
        targets: T,
        handler: impl Fn(&C, &T) + 'static,
    ) -> bool {
        self.register_handler(move |command: &C| handler(command, &targets))
    }

    /// Stop handling `C` here, without falling through to the parent.
    pub fn unregister_handler<C: Command>(&self) {
        let previous = self
            .inner
            .table
            .borrow_mut()
            .insert(TypeId::of::<C>(), Slot::Suppressed);
        drop(previous);
    }

    /// Forget everything about `C` here, so dispatch falls through to the
    /// parent again.
    pub fn reset_handler<C: Command>(&self) {
        let previous = self.inner.table.borrow_mut().remove(&TypeId::of::<C>());
        drop(previous);
    }

    /// Whether this router (not its parents) has a live handler for `C`.
    #[must_use]
    pub fn has_handler<C: Command>(&self) -> bool {
        matches!(
            self.inner.table.borrow().get(&TypeId::of::<C>()),
            Some(Slot::Handler(_))
        )
    }

    /// Route `command` to the nearest handler in the delegation chain.
    pub fn dispatch<C: Command>(&self, command: &C) -> Dispatched {
        let key = TypeId::of::<C>();
        let mut visited: Vec<*const RouterInner> = Vec::new();
        let mut router = self.clone();
        loop {
            visited.push(Rc::as_ptr(&router.inner));
            match router.lookup(key) {
                Lookup::Handler(handler) => {
                    let handler: &dyn Any = &*handler;
                    // Slots are keyed by the command's own TypeId.
                    let Some(typed) = handler.downcast_ref::<TypedHandler<C>>() else {
                        unreachable!(
                            "handler slot for {} holds another command type",
                            command.command_name()
                        );
                    };
                    (typed.call)(command);
                    return Dispatched::Handled;
                }
                Lookup::Suppressed => {
                    tracing::trace!(
                        message = "command.suppressed",
                        command = command.command_name()
                    );
                    return Dispatched::Unhandled;
                }
                Lookup::Missing => {
                    let Some(parent) = router.parent() else {
                        break;
                    };
                    if visited.contains(&Rc::as_ptr(&parent.inner)) {
                        break;
                    }
                    router = parent;
                }
            }
        }
        self.report_unhandled(command.command_name());
        Dispatched::Unhandled
    }

    fn lookup(&self, key: TypeId) -> Lookup {
        match self.inner.table.borrow().get(&key) {
            Some(Slot::Handler(handler)) => Lookup::Handler(Rc::clone(handler)),
            Some(Slot::Suppressed) => Lookup::Suppressed,
            None => Lookup::Missing,
        }
    }

    fn report_unhandled(&self, command: &'static str) {
        match self.inner.unhandled {
            UnhandledCommandPolicy::Ignore => {}
            UnhandledCommandPolicy::Debug => {
                tracing::debug!(message = "command.unhandled", command);
            }
            UnhandledCommandPolicy::Warn => {
                tracing::warn!(message = "command.unhandled", command);
            }
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanflow_core::{Container, ContainerRegistry};
    use std::cell::{Cell, RefCell};

    #[derive(Debug)]
    struct SelectDevice(&'static str);
    impl Command for SelectDevice {}

    #[derive(Debug)]
    struct SetDpi(u32);
    impl Command for SetDpi {}

    struct Unknown;
    impl Command for Unknown {}

    fn select(cmd: &SelectDevice, device: &Container<String>) {
        device.update(|name, _| *name = cmd.0.to_owned());
    }

    #[test]
    fn dispatch_reaches_bound_target() {
        let registry = ContainerRegistry::new();
        let device: Container<String> = Container::new(&registry, String::new());
        let router = CommandRouter::new();
        router.bind_handler(device.clone(), select);

        assert_eq!(router.dispatch(&SelectDevice("usb:1")), Dispatched::Handled);
        assert_eq!(&*device.read(), "usb:1");
        assert_eq!(device.version(), 2);
    }

    #[test]
    fn multiple_targets_bind_as_tuple() {
        let registry = ContainerRegistry::new();
        let dpi: Container<u32> = Container::new(&registry, 75);
        let log: Container<Vec<String>> = Container::new(&registry, Vec::new());
        let router = CommandRouter::new();
        router.bind_handler(
            (dpi.clone(), log.clone()),
            |cmd: &SetDpi, (dpi, log): &(Container<u32>, Container<Vec<String>>)| {
                dpi.update(|v, _| *v = cmd.0);
                log.update(|l, _| l.push(format!("dpi={}", cmd.0)));
            },
        );
        router.dispatch(&SetDpi(1200));
        assert_eq!(*dpi.read(), 1200);
        assert_eq!(log.read().as_slice(), ["dpi=1200"]);
    }

    struct Nudge<T>(T);
    impl<T: 'static> Command for Nudge<T> {}

    #[test]
    fn each_command_type_reaches_its_own_handler() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let router = CommandRouter::new();
        router.bind_handler(Rc::clone(&seen), |cmd: &Nudge<u8>, seen: &Rc<RefCell<Vec<String>>>| {
            seen.borrow_mut().push(format!("u8:{}", cmd.0));
        });
        router.bind_handler(Rc::clone(&seen), |cmd: &Nudge<i64>, seen: &Rc<RefCell<Vec<String>>>| {
            seen.borrow_mut().push(format!("i64:{}", cmd.0));
        });

        assert_eq!(router.dispatch(&Nudge(-4_i64)), Dispatched::Handled);
        assert_eq!(router.dispatch(&Nudge(7_u8)), Dispatched::Handled);
        assert_eq!(router.dispatch(&Nudge(1_u16)), Dispatched::Unhandled);
        assert_eq!(seen.borrow().as_slice(), ["i64:-4", "u8:7"]);
    }

    #[test]
    fn unregistered_type_without_parent_is_noop() {
        let router = CommandRouter::new();
        assert_eq!(router.dispatch(&Unknown), Dispatched::Unhandled);
    }

    #[test]
    fn reregistration_replaces_and_drops_previous_handler() {
        let router = CommandRouter::new();
        let token = Rc::new(());
        let held = Rc::clone(&token);
        let first = Rc::new(Cell::new(0));
        let second = Rc::new(Cell::new(0));

        let f = Rc::clone(&first);
        assert!(!router.register_handler(move |_: &SetDpi| {
            let _keep = &held;
            f.set(f.get() + 1);
        }));
        assert_eq!(Rc::strong_count(&token), 2);

        let s = Rc::clone(&second);
        assert!(router.register_handler(move |_: &SetDpi| s.set(s.get() + 1)));
        assert_eq!(Rc::strong_count(&token), 1, "old handler disposed");

        router.dispatch(&SetDpi(1));
        assert_eq!((first.get(), second.get()), (0, 1));
    }

    #[test]
    fn child_delegates_to_parent() {
        let parent = CommandRouter::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        parent.register_handler(move |_: &SetDpi| h.set(h.get() + 1));

        let child = parent.child();
        assert!(child.dispatch(&SetDpi(300)).is_handled());
        assert_eq!(hits.get(), 1);
        assert!(!child.has_handler::<SetDpi>());
    }

    #[test]
    fn child_handler_shadows_parent() {
        let parent = CommandRouter::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let p = Rc::clone(&seen);
        parent.register_handler(move |_: &SetDpi| p.borrow_mut().push("parent"));
        let child = parent.child();
        let c = Rc::clone(&seen);
        child.register_handler(move |_: &SetDpi| c.borrow_mut().push("child"));

        child.dispatch(&SetDpi(1));
        parent.dispatch(&SetDpi(1));
        assert_eq!(*seen.borrow(), vec!["child", "parent"]);
    }

    #[test]
    fn unregister_is_a_floor_stop() {
        let parent = CommandRouter::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        parent.register_handler(move |_: &SetDpi| h.set(h.get() + 1));

        let child = parent.child();
        child.register_handler(|_: &SetDpi| {});
        child.unregister_handler::<SetDpi>();

        assert_eq!(child.dispatch(&SetDpi(1)), Dispatched::Unhandled);
        assert_eq!(hits.get(), 0, "parent must not be consulted");

        // A type the child never registered still falls through.
        let devices = Rc::new(Cell::new(0));
        let d = Rc::clone(&devices);
        parent.register_handler(move |_: &SelectDevice| d.set(d.get() + 1));
        assert!(child.dispatch(&SelectDevice("x")).is_handled());
        assert_eq!(devices.get(), 1);
    }

    #[test]
    fn reset_handler_resumes_delegation() {
        let parent = CommandRouter::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        parent.register_handler(move |_: &SetDpi| h.set(h.get() + 1));
        let child = parent.child();
        child.unregister_handler::<SetDpi>();
        child.reset_handler::<SetDpi>();
        assert!(child.dispatch(&SetDpi(1)).is_handled());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn self_parent_is_ignored() {
        let router = CommandRouter::new();
        router.set_parent(Some(&router));
        assert!(router.parent().is_none());
        assert_eq!(router.dispatch(&Unknown), Dispatched::Unhandled);
    }

    #[test]
    fn cyclic_parent_chain_terminates() {
        let a = CommandRouter::new();
        let b = a.child();
        a.set_parent(Some(&b));
        assert_eq!(b.dispatch(&Unknown), Dispatched::Unhandled);
        // Break the Rc cycle so the test does not leak.
        a.set_parent(None);
    }

    #[test]
    fn handler_may_dispatch_reentrantly() {
        let registry = ContainerRegistry::new();
        let dpi: Container<u32> = Container::new(&registry, 0);
        let router = CommandRouter::new();

        let inner_router = router.clone();
        router.register_handler(move |cmd: &SelectDevice| {
            if cmd.0.starts_with("usb") {
                inner_router.dispatch(&SetDpi(300));
            }
        });
        router.bind_handler(dpi.clone(), |cmd: &SetDpi, dpi: &Container<u32>| {
            dpi.update(|v, _| *v = cmd.0);
        });

        router.dispatch(&SelectDevice("usb:2"));
        assert_eq!(*dpi.read(), 300);
    }

    #[test]
    fn handler_may_replace_itself_mid_dispatch() {
        let router = CommandRouter::new();
        let calls = Rc::new(Cell::new(0));
        let r = router.clone();
        let c = Rc::clone(&calls);
        router.register_handler(move |_: &SetDpi| {
            c.set(c.get() + 1);
            r.register_handler(|_: &SetDpi| {});
        });
        router.dispatch(&SetDpi(1));
        router.dispatch(&SetDpi(1));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn command_name_defaults_to_type_name() {
        assert!(SetDpi(1).command_name().ends_with("SetDpi"));
    }

    #[test]
    fn debug_counts_slots() {
        let router = CommandRouter::new();
        router.register_handler(|_: &SetDpi| {});
        router.unregister_handler::<Unknown>();
        let dbg = format!("{router:?}");
        assert!(dbg.contains("handlers: 1"));
        assert!(dbg.contains("suppressed: 1"));
    }
}
