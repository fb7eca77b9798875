#![forbid(unsafe_code)]

//! Test harness and reference fixtures for Scanflow.
//!
//! - [`CallLog`]: ordered record of observer and handler invocations.
//! - [`Wiring`]: builds a scheduler from an abstract graph description so
//!   property tests can generate arbitrary dependency graphs.
//! - [`TraceCapture`]: a `tracing` layer that records events and spans, for
//!   asserting on the engine's structured log output.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use scanflow_core::{Container, ContainerRegistry};
use scanflow_runtime::{Observer, ObserverId, ObserverScheduler, UpdateCx};
use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

// ── Call log ─────────────────────────────────────────────────────────

/// Shared, ordered log of invocation tags.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Rc<RefCell<Vec<String>>>,
}

impl CallLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tag: impl Into<String>) {
        self.entries.borrow_mut().push(tag.into());
    }

    /// Observer body that appends `tag` each time it runs.
    pub fn recorder(&self, tag: impl Into<String>) -> impl FnMut(&UpdateCx<'_>) + 'static {
        let log = self.clone();
        let tag = tag.into();
        move |_: &UpdateCx<'_>| log.push(tag.clone())
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    /// All entries concatenated; handy for single-character tags.
    #[must_use]
    pub fn joined(&self) -> String {
        self.entries.borrow().concat()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Index of the first occurrence of `tag`.
    #[must_use]
    pub fn position(&self, tag: &str) -> Option<usize> {
        self.entries.borrow().iter().position(|entry| entry == tag)
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

// ── Graph wiring ─────────────────────────────────────────────────────

/// Abstract observer: indices into the wiring's container list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSpec {
    pub observes: Vec<usize>,
    pub modifies: Vec<usize>,
}

/// A scheduler built from [`NodeSpec`]s. Observer `i` is named `n{i}`,
/// logs its name when it runs, and bumps every container it modifies.
pub struct Wiring {
    pub registry: ContainerRegistry,
    pub containers: Vec<Container<u64>>,
    pub scheduler: ObserverScheduler,
    pub ids: Vec<ObserverId>,
    pub log: CallLog,
    pub nodes: Vec<NodeSpec>,
}

impl fmt::Debug for Wiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wiring")
            .field("containers", &self.containers.len())
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

impl Wiring {
    /// Build `container_count` containers and one observer per node.
    /// Out-of-range indices are reduced modulo the container count.
    #[must_use]
    pub fn build(container_count: usize, nodes: &[NodeSpec]) -> Self {
        let container_count = container_count.max(1);
        let registry = ContainerRegistry::new();
        let containers: Vec<Container<u64>> = (0..container_count)
            .map(|_| Container::new(&registry, 0))
            .collect();
        let scheduler = ObserverScheduler::new();
        let log = CallLog::new();
        let mut normalized = Vec::with_capacity(nodes.len());
        let mut ids = Vec::with_capacity(nodes.len());

        for (i, node) in nodes.iter().enumerate() {
            let node = NodeSpec {
                observes: node.observes.iter().map(|c| c % container_count).collect(),
                modifies: node.modifies.iter().map(|c| c % container_count).collect(),
            };
            let name = format!("n{i}");
            let targets: Vec<Container<u64>> =
                node.modifies.iter().map(|&c| containers[c].clone()).collect();
            let entry = log.clone();
            let tag = name.clone();
            let mut observer = Observer::new(name, move |_| {
                entry.push(tag.clone());
                for target in &targets {
                    target.update(|v, _| *v += 1);
                }
            });
            for &c in &node.observes {
                observer = observer.observes(&containers[c]);
            }
            for &c in &node.modifies {
                observer = observer.modifies(&containers[c]);
            }
            ids.push(scheduler.add(observer));
            normalized.push(node);
        }

        Self {
            registry,
            containers,
            scheduler,
            ids,
            log,
            nodes: normalized,
        }
    }

    /// Every (writer, reader) pair implied by the node specs.
    #[must_use]
    pub fn edges(&self) -> Vec<(usize, usize)> {
        let mut edges = Vec::new();
        for (w, writer) in self.nodes.iter().enumerate() {
            for (r, reader) in self.nodes.iter().enumerate() {
                if writer.modifies.iter().any(|c| reader.observes.contains(c)) {
                    edges.push((w, r));
                }
            }
        }
        edges
    }

    /// Whether the writer/reader graph has a cycle, self-edges included.
    #[must_use]
    pub fn has_cycle(&self) -> bool {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let edges = self.edges();
        for &(_, r) in &edges {
            indegree[r] += 1;
        }
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut placed = 0;
        while let Some(node) = ready.pop() {
            placed += 1;
            for &(w, r) in &edges {
                if w == node {
                    indegree[r] -= 1;
                    if indegree[r] == 0 {
                        ready.push(r);
                    }
                }
            }
        }
        placed != n
    }
}

// ── Trace capture ────────────────────────────────────────────────────

/// One captured `tracing` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    pub level: tracing::Level,
    pub message: Option<String>,
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct CaptureState {
    events: Vec<CapturedEvent>,
    spans: Vec<String>,
    span_records: BTreeMap<String, BTreeMap<String, String>>,
}

/// Layer recording every event, span name, and span field record.
#[derive(Debug, Clone, Default)]
pub struct TraceCapture {
    state: Arc<Mutex<CaptureState>>,
}

struct FieldVisitor<'a> {
    message: &'a mut Option<String>,
    fields: &'a mut BTreeMap<String, String>,
}

impl tracing::field::Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let text = format!("{value:?}");
        if field.name() == "message" {
            *self.message = Some(text.trim_matches('"').to_string());
        } else {
            self.fields.insert(field.name().to_string(), text);
        }
    }
}

impl<S> Layer<S> for TraceCapture
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        _id: &tracing::Id,
        _ctx: Context<'_, S>,
    ) {
        if let Ok(mut state) = self.state.lock() {
            state.spans.push(attrs.metadata().name().to_string());
        }
    }

    fn on_record(
        &self,
        id: &tracing::Id,
        values: &tracing::span::Record<'_>,
        ctx: Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut message = None;
        let mut fields = BTreeMap::new();
        values.record(&mut FieldVisitor {
            message: &mut message,
            fields: &mut fields,
        });
        if let Ok(mut state) = self.state.lock() {
            state
                .span_records
                .entry(span.metadata().name().to_string())
                .or_default()
                .extend(fields);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = None;
        let mut fields = BTreeMap::new();
        event.record(&mut FieldVisitor {
            message: &mut message,
            fields: &mut fields,
        });
        if let Ok(mut state) = self.state.lock() {
            state.events.push(CapturedEvent {
                level: *event.metadata().level(),
                message,
                fields,
            });
        }
    }
}

impl TraceCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with this layer installed as the thread's default
    /// subscriber.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::with_default(subscriber, f)
    }

    #[must_use]
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.state
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    /// Events whose message equals `message`.
    #[must_use]
    pub fn events_named(&self, message: &str) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.message.as_deref() == Some(message))
            .collect()
    }

    #[must_use]
    pub fn saw_span(&self, name: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.spans.iter().any(|span| span == name))
            .unwrap_or(false)
    }

    /// Last recorded value of `field` on spans named `span`.
    #[must_use]
    pub fn span_field(&self, span: &str, field: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.span_records.get(span)?.get(field).cloned())
    }
}
