//! In-process event bus.
//!
//! Observability spine of the runtime: every component publishes
//! [`BusEvent`]s keyed by `(client id, source topic)`, and embedders attach
//! listeners through the facade's `listen_*` family. Subscribers registered
//! under the wildcard client `"*"` observe the topic across all clients.
//!
//! Delivery is serial and ordered: `emit` completes only after every
//! matching listener has run, in subscription order. Listeners are async
//! callbacks; a slow listener therefore backpressures the emitting turn,
//! which is deliberate — event order is part of the runtime's contract.
//!
//! ```text
//! agent ──┐
//! history ─┤ emit(client, event)      subscribe(client, source, fn)
//! session ─┼──────────────► EventBus ◄──────────────────────────────
//! storage ─┤                  │
//! state  ──┤                  └─► listeners (exact client, then "*", by age)
//! swarm  ──┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::swarm::types::{AgentName, ClientId, StateName, StorageName, SwarmName};

/// Topic an event was published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    AgentBus,
    HistoryBus,
    SessionBus,
    StateBus,
    StorageBus,
    SwarmBus,
}

/// Names of the entities involved in an event, where known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<AgentName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swarm_name: Option<SwarmName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_name: Option<StorageName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_name: Option<StateName>,
}

/// A single observable runtime event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub source: EventSource,
    pub client_id: ClientId,
    /// Event discriminator, e.g. `"execute"`, `"emit-output"`, `"push"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Snapshot of the operation's input, `Null` when not applicable.
    pub input: serde_json::Value,
    /// Snapshot of the operation's output, `Null` when not applicable.
    pub output: serde_json::Value,
    pub context: EventContext,
    pub created_at: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(source: EventSource, client_id: impl Into<ClientId>, kind: impl Into<String>) -> Self {
        Self {
            source,
            client_id: client_id.into(),
            kind: kind.into(),
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            context: EventContext::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }
}

/// Async listener callback.
pub type BusListener = Arc<dyn Fn(BusEvent) -> BoxFuture<'static, ()> + Send + Sync>;
/// Predicate deciding whether a `once` listener fires for an event.
pub type BusFilter = Arc<dyn Fn(&BusEvent) -> bool + Send + Sync>;

/// Wrap an async closure into a [`BusListener`].
pub fn listener<F, Fut>(f: F) -> BusListener
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

struct Subscription {
    id: u64,
    listener: BusListener,
    filter: Option<BusFilter>,
    once: bool,
}

struct BusInner {
    subs: HashMap<(ClientId, EventSource), Vec<Subscription>>,
    next_id: u64,
}

/// Handle returned by `subscribe`/`once`; detaches the listener.
pub struct BusSubscription {
    inner: Weak<Mutex<BusInner>>,
    key: (ClientId, EventSource),
    id: u64,
}

impl BusSubscription {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut guard = inner.lock().expect("bus lock poisoned");
            if let Some(list) = guard.subs.get_mut(&self.key) {
                list.retain(|sub| sub.id != self.id);
                if list.is_empty() {
                    guard.subs.remove(&self.key);
                }
            }
        }
    }
}

/// The bus itself. Cheap to clone; all clones share one subscription table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                subs: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Attach a persistent listener for `(client_id, source)`.
    /// `client_id = "*"` listens across all clients.
    pub fn subscribe(
        &self,
        client_id: impl Into<ClientId>,
        source: EventSource,
        listener: BusListener,
    ) -> BusSubscription {
        self.attach(client_id.into(), source, listener, None, false)
    }

    /// Attach a listener that fires at most once, and only for events
    /// accepted by `filter`.
    pub fn once(
        &self,
        client_id: impl Into<ClientId>,
        source: EventSource,
        filter: BusFilter,
        listener: BusListener,
    ) -> BusSubscription {
        self.attach(client_id.into(), source, listener, Some(filter), true)
    }

    fn attach(
        &self,
        client_id: ClientId,
        source: EventSource,
        listener: BusListener,
        filter: Option<BusFilter>,
        once: bool,
    ) -> BusSubscription {
        let mut guard = self.inner.lock().expect("bus lock poisoned");
        let id = guard.next_id;
        guard.next_id += 1;
        let key = (client_id, source);
        guard.subs.entry(key.clone()).or_default().push(Subscription {
            id,
            listener,
            filter,
            once,
        });
        BusSubscription {
            inner: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    /// Deliver `event` to every matching listener, serially, in
    /// subscription order. Resolves after the last listener returns.
    pub async fn emit(&self, client_id: &str, event: BusEvent) {
        let matched: Vec<(u64, bool, BusListener, ClientId, EventSource)> = {
            let guard = self.inner.lock().expect("bus lock poisoned");
            let mut matched = Vec::new();
            for key_client in [client_id, "*"] {
                let key = (key_client.to_string(), event.source);
                if let Some(list) = guard.subs.get(&key) {
                    for sub in list {
                        let passes = sub
                            .filter
                            .as_ref()
                            .map(|filter| filter(&event))
                            .unwrap_or(true);
                        if passes {
                            matched.push((
                                sub.id,
                                sub.once,
                                Arc::clone(&sub.listener),
                                key.0.clone(),
                                key.1,
                            ));
                        }
                    }
                }
            }
            matched.sort_by_key(|entry| entry.0);
            matched
        };

        let mut fired_once = Vec::new();
        for (id, once, listener, key_client, source) in matched {
            listener(event.clone()).await;
            if once {
                fired_once.push((id, key_client, source));
            }
        }

        if !fired_once.is_empty() {
            let mut guard = self.inner.lock().expect("bus lock poisoned");
            for (id, key_client, source) in fired_once {
                let key = (key_client, source);
                if let Some(list) = guard.subs.get_mut(&key) {
                    list.retain(|sub| sub.id != id);
                    if list.is_empty() {
                        guard.subs.remove(&key);
                    }
                }
            }
        }
    }

    /// Drop every subscription held for `client_id` across all sources.
    pub fn dispose(&self, client_id: &str) {
        let mut guard = self.inner.lock().expect("bus lock poisoned");
        guard.subs.retain(|(key_client, _), _| key_client != client_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
