//! Entity schemas and the traits external collaborators implement.
//!
//! A swarm deployment is described declaratively: agents, tools, swarms,
//! completions, embeddings, storages and states are each registered as a
//! schema keyed by a unique name. Schemas are plain data plus trait objects
//! at the seams where the runtime calls out — the completion backend
//! ([`CompletionProvider`]), tool bodies ([`ToolHandler`]) and the
//! embedding backend ([`EmbeddingProvider`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use agent_swarm::{AgentSchema, SwarmSchema};
//!
//! let agent = AgentSchema::new("triage", "mock-completion", "You route customers.")
//!     .with_tools(["navigate"])
//!     .with_max_tool_calls(3);
//!
//! let swarm = SwarmSchema::new("support", "triage", ["triage", "sales", "refund"]);
//! ```

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::swarm::types::{
    AgentName, ClientId, CompletionArgs, CompletionName, EmbeddingName, ExecutionMode,
    ModelMessage, StateName, StorageName, SwarmName, ToolCall, ToolCallId, ToolFunction,
    ToolName,
};

// ── Completion ────────────────────────────────────────────────────────────

/// The LLM completion backend. One implementation per provider; the
/// runtime is provider-agnostic and never inspects transport details.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Produce the next assistant message for the supplied conversation.
    async fn get_completion(
        &self,
        args: CompletionArgs,
    ) -> Result<ModelMessage, Box<dyn Error + Send + Sync>>;
}

/// Named registration of a completion backend.
#[derive(Clone)]
pub struct CompletionSchema {
    pub completion_name: CompletionName,
    pub provider: Arc<dyn CompletionProvider>,
}

impl CompletionSchema {
    pub fn new(completion_name: impl Into<CompletionName>, provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            completion_name: completion_name.into(),
            provider,
        }
    }
}

// ── Embedding ─────────────────────────────────────────────────────────────

/// The embedding/similarity backend used by storage search.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn create_embedding(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>>;

    async fn calculate_similarity(
        &self,
        a: &[f32],
        b: &[f32],
    ) -> Result<f64, Box<dyn Error + Send + Sync>>;
}

/// Named registration of an embedding backend.
#[derive(Clone)]
pub struct EmbeddingSchema {
    pub embedding_name: EmbeddingName,
    pub provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingSchema {
    pub fn new(embedding_name: impl Into<EmbeddingName>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedding_name: embedding_name.into(),
            provider,
        }
    }
}

// ── Tools ─────────────────────────────────────────────────────────────────

/// Everything a tool body receives when dispatched.
///
/// `swarm` is a live facade handle: tools navigate, commit messages and
/// drive further turns through it exactly like an external embedder would.
#[derive(Clone)]
pub struct ToolRequest {
    /// Id of the call being served; pass to `commit_tool_output`.
    pub tool_id: ToolCallId,
    pub client_id: ClientId,
    pub agent_name: AgentName,
    /// Parsed JSON arguments from the model.
    pub params: serde_json::Value,
    /// The full (already truncated) call list of the assistant message.
    pub tool_calls: Vec<ToolCall>,
    /// Whether this is the last call of the chain.
    pub is_last: bool,
    /// Facade handle for re-entrant runtime calls.
    pub swarm: crate::swarm::facade::AgentSwarm,
}

/// A tool implementation.
///
/// `call` runs detached from the dispatching turn: it may submit messages
/// or drive `execute` on the same client without deadlocking, and it
/// signals completion by committing a tool output (or by stopping the
/// chain / changing the agent). Returning `Err` publishes the turn's
/// `tool_error` signal and triggers rescue.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, request: ToolRequest) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Cheap pre-dispatch parameter check. Rejecting rescues the turn.
    async fn validate(&self, _request: &ToolRequest) -> bool {
        true
    }
}

/// Lifecycle hooks around a tool dispatch.
#[derive(Clone, Default)]
pub struct ToolCallbacks {
    pub on_before_call: Option<Arc<dyn Fn(&ToolRequest) + Send + Sync>>,
    pub on_after_call: Option<Arc<dyn Fn(&ToolRequest) + Send + Sync>>,
    pub on_validate: Option<Arc<dyn Fn(&ToolRequest, bool) + Send + Sync>>,
    pub on_call_error: Option<Arc<dyn Fn(&ToolRequest, &str) + Send + Sync>>,
}

/// Named registration of a tool: wire description + handler + hooks.
#[derive(Clone)]
pub struct ToolSchema {
    pub tool_name: ToolName,
    /// Wire-level function description forwarded to the model.
    pub function: ToolFunction,
    pub handler: Arc<dyn ToolHandler>,
    pub callbacks: ToolCallbacks,
}

impl ToolSchema {
    pub fn new(
        tool_name: impl Into<ToolName>,
        function: ToolFunction,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            function,
            handler,
            callbacks: ToolCallbacks::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: ToolCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// Closure-backed [`ToolHandler`] for tools that do not need a struct.
pub struct FnToolHandler {
    call_fn: Arc<
        dyn Fn(ToolRequest) -> BoxFuture<'static, Result<(), Box<dyn Error + Send + Sync>>>
            + Send
            + Sync,
    >,
    validate_fn: Option<Arc<dyn Fn(&ToolRequest) -> bool + Send + Sync>>,
}

impl FnToolHandler {
    pub fn new<F, Fut>(call: F) -> Self
    where
        F: Fn(ToolRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Box<dyn Error + Send + Sync>>> + Send + 'static,
    {
        Self {
            call_fn: Arc::new(move |request| Box::pin(call(request))),
            validate_fn: None,
        }
    }

    pub fn with_validate<V>(mut self, validate: V) -> Self
    where
        V: Fn(&ToolRequest) -> bool + Send + Sync + 'static,
    {
        self.validate_fn = Some(Arc::new(validate));
        self
    }
}

#[async_trait]
impl ToolHandler for FnToolHandler {
    async fn call(&self, request: ToolRequest) -> Result<(), Box<dyn Error + Send + Sync>> {
        (self.call_fn)(request).await
    }

    async fn validate(&self, request: &ToolRequest) -> bool {
        match &self.validate_fn {
            Some(validate) => validate(request),
            None => true,
        }
    }
}

// ── Agents ────────────────────────────────────────────────────────────────

/// Transform applied to raw model output before validation and emission.
pub type OutputTransform = Arc<dyn Fn(String, &ClientId, &AgentName) -> String + Send + Sync>;
/// Output validator: `None` accepts, `Some(reason)` rejects with a reason.
pub type OutputValidator = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
/// Per-agent normalization of the raw completion message (e.g. lifting
/// JSON-encoded tool calls into the canonical `tool_calls` shape).
pub type MessageMap = Arc<dyn Fn(ModelMessage) -> ModelMessage + Send + Sync>;

/// Lifecycle hooks of an agent.
#[derive(Clone, Default)]
pub struct AgentCallbacks {
    pub on_execute: Option<Arc<dyn Fn(&ClientId, &AgentName, &str, ExecutionMode) + Send + Sync>>,
    pub on_output: Option<Arc<dyn Fn(&ClientId, &AgentName, &str) + Send + Sync>>,
    pub on_resurrect: Option<Arc<dyn Fn(&ClientId, &AgentName, &str) + Send + Sync>>,
    pub on_user_message: Option<Arc<dyn Fn(&ClientId, &AgentName, &str) + Send + Sync>>,
    pub on_assistant_message: Option<Arc<dyn Fn(&ClientId, &AgentName, &str) + Send + Sync>>,
    pub on_system_message: Option<Arc<dyn Fn(&ClientId, &AgentName, &str) + Send + Sync>>,
    pub on_flush: Option<Arc<dyn Fn(&ClientId, &AgentName) + Send + Sync>>,
    pub on_after_tool_calls: Option<Arc<dyn Fn(&ClientId, &AgentName, &[ToolCall]) + Send + Sync>>,
    pub on_tool_error: Option<Arc<dyn Fn(&ClientId, &AgentName, &ToolName, &str) + Send + Sync>>,
}

/// Declarative description of one agent.
#[derive(Clone)]
pub struct AgentSchema {
    pub agent_name: AgentName,
    /// Name of the completion backend serving this agent.
    pub completion: CompletionName,
    /// Main prompt, sent as the first system message of every completion.
    pub prompt: String,
    /// Extra system lines appended after the prompt.
    pub system: Vec<String>,
    pub tools: Vec<ToolName>,
    pub storages: Vec<StorageName>,
    pub states: Vec<StateName>,
    /// Agents this one expects to coexist with (presence-checked only).
    pub depends_on: Vec<AgentName>,
    pub validate: Option<OutputValidator>,
    pub transform: Option<OutputTransform>,
    pub map: Option<MessageMap>,
    /// Upper bound on tool calls dispatched per turn.
    pub max_tool_calls: Option<usize>,
    pub callbacks: AgentCallbacks,
}

impl AgentSchema {
    pub fn new(
        agent_name: impl Into<AgentName>,
        completion: impl Into<CompletionName>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            completion: completion.into(),
            prompt: prompt.into(),
            system: Vec::new(),
            tools: Vec::new(),
            storages: Vec::new(),
            states: Vec::new(),
            depends_on: Vec::new(),
            validate: None,
            transform: None,
            map: None,
            max_tool_calls: None,
            callbacks: AgentCallbacks::default(),
        }
    }

    pub fn with_system<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.system = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ToolName>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_storages<I, S>(mut self, storages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StorageName>,
    {
        self.storages = storages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StateName>,
    {
        self.states = states.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_depends_on<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentName>,
    {
        self.depends_on = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_validate<V>(mut self, validate: V) -> Self
    where
        V: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    pub fn with_transform<T>(mut self, transform: T) -> Self
    where
        T: Fn(String, &ClientId, &AgentName) -> String + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_map<M>(mut self, map: M) -> Self
    where
        M: Fn(ModelMessage) -> ModelMessage + Send + Sync + 'static,
    {
        self.map = Some(Arc::new(map));
        self
    }

    pub fn with_max_tool_calls(mut self, max: usize) -> Self {
        self.max_tool_calls = Some(max);
        self
    }

    pub fn with_callbacks(mut self, callbacks: AgentCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

// ── Swarms ────────────────────────────────────────────────────────────────

/// Lifecycle hooks of a swarm.
#[derive(Clone, Default)]
pub struct SwarmCallbacks {
    /// Fired after the active agent changed; arguments are
    /// `(client_id, new_agent, swarm_name)`.
    pub on_agent_changed: Option<Arc<dyn Fn(&ClientId, &AgentName, &SwarmName) + Send + Sync>>,
}

/// Declarative description of one swarm.
#[derive(Clone)]
pub struct SwarmSchema {
    pub swarm_name: SwarmName,
    pub default_agent: AgentName,
    pub agent_list: Vec<AgentName>,
    /// Persist active agent + navigation stack through the configured
    /// swarm persistence adapter.
    pub persist: bool,
    pub callbacks: SwarmCallbacks,
}

impl SwarmSchema {
    pub fn new<I, S>(
        swarm_name: impl Into<SwarmName>,
        default_agent: impl Into<AgentName>,
        agent_list: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentName>,
    {
        Self {
            swarm_name: swarm_name.into(),
            default_agent: default_agent.into(),
            agent_list: agent_list.into_iter().map(Into::into).collect(),
            persist: false,
            callbacks: SwarmCallbacks::default(),
        }
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_callbacks(mut self, callbacks: SwarmCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

// ── Storage ───────────────────────────────────────────────────────────────

/// Identifier of one storage item; providers use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemId::Number(n) => write!(f, "{}", n),
            ItemId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for ItemId {
    fn from(value: u64) -> Self {
        ItemId::Number(value)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        ItemId::Text(value.to_string())
    }
}

/// One record in a client storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageItem {
    pub id: ItemId,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

impl StorageItem {
    pub fn new(id: impl Into<ItemId>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Produces the text indexed for similarity search of one item.
pub type IndexFn = Arc<dyn Fn(&StorageItem) -> String + Send + Sync>;
/// Produces the initial data set of a fresh storage instance.
pub type DefaultDataFn = Arc<dyn Fn(&ClientId, &StorageName) -> Vec<StorageItem> + Send + Sync>;

/// Lifecycle hooks of a storage.
#[derive(Clone, Default)]
pub struct StorageCallbacks {
    pub on_init: Option<Arc<dyn Fn(&ClientId, &StorageName) + Send + Sync>>,
    pub on_update: Option<Arc<dyn Fn(&ClientId, &StorageName, &[StorageItem]) + Send + Sync>>,
    pub on_search: Option<Arc<dyn Fn(&ClientId, &StorageName, &str) + Send + Sync>>,
    pub on_dispose: Option<Arc<dyn Fn(&ClientId, &StorageName) + Send + Sync>>,
}

/// Declarative description of one storage.
#[derive(Clone)]
pub struct StorageSchema {
    pub storage_name: StorageName,
    /// Embedding backend used by similarity search.
    pub embedding: EmbeddingName,
    pub create_index: IndexFn,
    /// Swarm-wide single instance instead of per-client instances.
    pub shared: bool,
    /// Persist data through the configured storage persistence adapter.
    pub persist: bool,
    pub get_default_data: Option<DefaultDataFn>,
    pub callbacks: StorageCallbacks,
}

impl StorageSchema {
    pub fn new<F>(
        storage_name: impl Into<StorageName>,
        embedding: impl Into<EmbeddingName>,
        create_index: F,
    ) -> Self
    where
        F: Fn(&StorageItem) -> String + Send + Sync + 'static,
    {
        Self {
            storage_name: storage_name.into(),
            embedding: embedding.into(),
            create_index: Arc::new(create_index),
            shared: false,
            persist: false,
            get_default_data: None,
            callbacks: StorageCallbacks::default(),
        }
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_default_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&ClientId, &StorageName) -> Vec<StorageItem> + Send + Sync + 'static,
    {
        self.get_default_data = Some(Arc::new(f));
        self
    }

    pub fn with_callbacks(mut self, callbacks: StorageCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

// ── State ─────────────────────────────────────────────────────────────────

/// State payloads are untyped JSON; validation is the embedder's concern.
pub type StateValue = serde_json::Value;
/// Produces the initial value of a fresh state cell.
pub type DefaultStateFn = Arc<dyn Fn(&ClientId, &StateName) -> StateValue + Send + Sync>;
/// Applied in order to every value written into the cell.
pub type StateMiddleware = Arc<dyn Fn(StateValue, &ClientId, &StateName) -> StateValue + Send + Sync>;

/// Lifecycle hooks of a state cell.
#[derive(Clone, Default)]
pub struct StateCallbacks {
    pub on_init: Option<Arc<dyn Fn(&ClientId, &StateName) + Send + Sync>>,
    pub on_read: Option<Arc<dyn Fn(&ClientId, &StateName, &StateValue) + Send + Sync>>,
    pub on_write: Option<Arc<dyn Fn(&ClientId, &StateName, &StateValue) + Send + Sync>>,
    pub on_dispose: Option<Arc<dyn Fn(&ClientId, &StateName) + Send + Sync>>,
}

/// Declarative description of one state cell.
#[derive(Clone)]
pub struct StateSchema {
    pub state_name: StateName,
    pub get_default_state: DefaultStateFn,
    pub middlewares: Vec<StateMiddleware>,
    /// Swarm-wide single instance instead of per-client instances.
    pub shared: bool,
    /// Persist through the configured state persistence adapter.
    pub persist: bool,
    pub callbacks: StateCallbacks,
}

impl StateSchema {
    pub fn new<F>(state_name: impl Into<StateName>, get_default_state: F) -> Self
    where
        F: Fn(&ClientId, &StateName) -> StateValue + Send + Sync + 'static,
    {
        Self {
            state_name: state_name.into(),
            get_default_state: Arc::new(get_default_state),
            middlewares: Vec::new(),
            shared: false,
            persist: false,
            callbacks: StateCallbacks::default(),
        }
    }

    pub fn with_middleware<M>(mut self, middleware: M) -> Self
    where
        M: Fn(StateValue, &ClientId, &StateName) -> StateValue + Send + Sync + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_callbacks(mut self, callbacks: StateCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_item_round_trips_flattened_payload() {
        let item = StorageItem::new(7u64, serde_json::json!({"title": "refund policy"}));
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["title"], "refund policy");

        let back: StorageItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn item_ids_accept_numbers_and_strings() {
        let a: ItemId = serde_json::from_value(serde_json::json!(42)).unwrap();
        let b: ItemId = serde_json::from_value(serde_json::json!("doc-1")).unwrap();
        assert_eq!(a, ItemId::Number(42));
        assert_eq!(b, ItemId::Text("doc-1".to_string()));
    }
}
