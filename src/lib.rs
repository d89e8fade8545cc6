//! # agent-swarm
//!
//! A runtime for orchestrating swarms of cooperating LLM-backed agents
//! that share a single conversational session per client. A client
//! connects, sends messages, and the runtime routes each message to the
//! currently-active agent of that client's swarm. Agents may invoke
//! tools; tools may mutate shared storage/state, commit messages to
//! history, or transfer control to another agent mid-turn.
//!
//! The runtime guarantees serialized per-client execution, recovery from
//! malformed model output (the "rescue" machinery), bounded tool-call
//! chains, and event-driven observability over an in-process bus.
//!
//! ```text
//! AgentSwarm (facade)
//!   └─ ClientSession   per-client FIFO gateway
//!       └─ ClientSwarm active agent + navigation stack
//!           └─ ClientAgent  turn engine (completion → tools → output)
//!               ├─ ClientHistory   append-only log + filtered projection
//!               ├─ CompletionProvider / ToolHandler / EmbeddingProvider
//!               └─ EventBus        (client, source)-keyed pub/sub
//! ```
//!
//! The LLM completion backend, the embedding backend and tool bodies are
//! external collaborators supplied as trait objects; the runtime itself
//! is provider- and prompt-agnostic.

pub mod swarm;

// Re-export the embedder-facing surface at the crate root.
pub use swarm::bus::{
    listener, BusEvent, BusFilter, BusListener, BusSubscription, EventContext, EventSource,
};
pub use swarm::client_session::{outgoing, OutgoingMessage, SessionReceive, SessionSend};
pub use swarm::config::{ConfigUpdate, RescueFn, RescueStrategy, SwarmConfig, PROCESS_UUID};
pub use swarm::context::{ExecutionContext, MethodContext};
pub use swarm::error::SwarmError;
pub use swarm::facade::{
    AgentSwarm, AutoDispose, SessionContext, SwarmConnection, SwarmSession,
};
pub use swarm::logger::{LogCrateAdapter, LoggerAdapter};
pub use swarm::persist::{
    FsStatePersist, FsStoragePersist, FsSwarmPersist, PersistBase, PersistList,
    StatePersistAdapter, StoragePersistAdapter, SwarmPersistAdapter,
};
pub use swarm::schema::{
    AgentCallbacks, AgentSchema, CompletionProvider, CompletionSchema, EmbeddingProvider,
    EmbeddingSchema, FnToolHandler, ItemId, StateCallbacks, StateSchema, StateValue,
    StorageCallbacks, StorageItem, StorageSchema, SwarmCallbacks, SwarmSchema, ToolCallbacks,
    ToolHandler, ToolRequest, ToolSchema,
};
pub use swarm::types::{
    AgentName, ClientId, CompletionArgs, CompletionName, EmbeddingName, ExecutionId,
    ExecutionMode, FunctionCall, MessageRole, ModelMessage, SessionMode, StateName, StorageName,
    SwarmName, ToolCall, ToolCallId, ToolFunction, ToolName,
};
