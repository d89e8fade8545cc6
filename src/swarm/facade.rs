//! The public facade.
//!
//! [`AgentSwarm`] is the surface an embedder consumes: register schemas,
//! open sessions or connections, drive turns, commit messages, listen to
//! events, inspect history, operate storage/state and manage lifecycles.
//! Every entry is a thin wrapper that opens a [`MethodContext`] scope,
//! runs the relevant validations and delegates to the connection layer.
//!
//! Entries that may legally run *inside* a tool which is itself executing
//! inside a turn (`execute`, the commit family, agent changes) first
//! suppress the ambient contexts with a context-begin wrapper, then open
//! their own scope — the re-entrant call must not inherit the outer
//! turn's identity.
//!
//! The handle is cheap to clone and internally shared: tools receive a
//! clone in their [`ToolRequest`](crate::swarm::schema::ToolRequest) and
//! use it exactly like external code does.
//!
//! # Example
//!
//! ```rust,no_run
//! use agent_swarm::{AgentSchema, AgentSwarm, CompletionSchema, SwarmSchema};
//! # use agent_swarm::CompletionProvider;
//! # use std::sync::Arc;
//!
//! # async fn demo(provider: Arc<dyn CompletionProvider>) -> Result<(), agent_swarm::SwarmError> {
//! let swarm = AgentSwarm::new();
//! swarm.add_completion(CompletionSchema::new("gpt", provider));
//! swarm.add_agent(AgentSchema::new("triage", "gpt", "You route customers."));
//! swarm.add_swarm(SwarmSchema::new("support", "triage", ["triage"]));
//!
//! let session = swarm.session("client-1", "support").await?;
//! let answer = session.complete("hello").await?;
//! session.dispose().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::swarm::bus::{BusFilter, BusListener, BusSubscription, EventBus, EventSource};
use crate::swarm::client_session::{ClientSession, SessionReceive, SessionSend};
use crate::swarm::client_swarm::ClientSwarm;
use crate::swarm::config::{ConfigUpdate, SharedConfig, SwarmConfig, PROCESS_UUID};
use crate::swarm::connection::ConnectionServices;
use crate::swarm::context::{
    begin_scope, execution_context, method_context, with_method_context, ExecutionContext,
    MethodContext,
};
use crate::swarm::error::SwarmError;
use crate::swarm::logger::{LoggerAdapter, SwarmLogger};
use crate::swarm::registry::SwarmRegistries;
use crate::swarm::schema::{
    AgentSchema, CompletionSchema, EmbeddingSchema, ItemId, StateSchema, StateValue,
    StorageItem, StorageSchema, SwarmSchema, ToolSchema,
};
use crate::swarm::signal::Signal;
use crate::swarm::storage::ClientStorage;
use crate::swarm::types::{
    AgentName, ClientId, ExecutionMode, ModelMessage, MessageRole, SessionMode, StateName,
    StorageName, SwarmName, ToolCallId,
};
use crate::swarm::validation::{SessionValidation, ValidationServices};

/// Shared core of one runtime instance.
pub struct SwarmCore {
    pub(crate) registries: Arc<SwarmRegistries>,
    pub(crate) validation: ValidationServices,
    pub(crate) session_validation: SessionValidation,
    pub(crate) connections: ConnectionServices,
    pub(crate) bus: EventBus,
    pub(crate) config: SharedConfig,
    pub(crate) logger: SwarmLogger,
}

/// Non-owning handle to the core, stored inside turn engines so that
/// tool requests can carry a live facade without keeping the runtime
/// alive on their own.
#[derive(Clone)]
pub struct WeakSwarmHandle {
    core: Weak<SwarmCore>,
}

impl WeakSwarmHandle {
    pub(crate) fn new(core: Weak<SwarmCore>) -> Self {
        Self { core }
    }

    pub(crate) fn upgrade(&self) -> Option<AgentSwarm> {
        self.core.upgrade().map(|core| AgentSwarm { core })
    }
}

/// Ambient identity snapshot returned by
/// [`AgentSwarm::get_session_context`].
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub client_id: Option<ClientId>,
    pub process_id: String,
    pub method_context: Option<MethodContext>,
    pub execution_context: Option<ExecutionContext>,
}

/// The embedder-facing runtime handle.
#[derive(Clone)]
pub struct AgentSwarm {
    core: Arc<SwarmCore>,
}

impl AgentSwarm {
    pub fn new() -> Self {
        let config: SharedConfig = Arc::new(std::sync::RwLock::new(SwarmConfig::default()));
        let logger = SwarmLogger::new(&config.read().expect("config lock poisoned"));
        let registries = Arc::new(SwarmRegistries::new());
        Self {
            core: Arc::new(SwarmCore {
                validation: ValidationServices::new(Arc::clone(&registries)),
                session_validation: SessionValidation::new(),
                connections: ConnectionServices::new(),
                bus: EventBus::new(),
                registries,
                config,
                logger,
            }),
        }
    }

    // ── Registration ──────────────────────────────────────────────────────

    /// Register an agent schema; returns the registered name.
    pub fn add_agent(&self, schema: AgentSchema) -> AgentName {
        self.core.registries.agents.register(schema.agent_name.clone(), schema)
    }

    /// Register a tool schema; returns the registered name.
    pub fn add_tool(&self, schema: ToolSchema) -> String {
        self.core.registries.tools.register(schema.tool_name.clone(), schema)
    }

    /// Register a swarm schema; returns the registered name.
    pub fn add_swarm(&self, schema: SwarmSchema) -> SwarmName {
        self.core.registries.swarms.register(schema.swarm_name.clone(), schema)
    }

    /// Register a completion backend; returns the registered name.
    pub fn add_completion(&self, schema: CompletionSchema) -> String {
        self.core
            .registries
            .completions
            .register(schema.completion_name.clone(), schema)
    }

    /// Register an embedding backend; returns the registered name.
    pub fn add_embedding(&self, schema: EmbeddingSchema) -> String {
        self.core
            .registries
            .embeddings
            .register(schema.embedding_name.clone(), schema)
    }

    /// Register a storage schema; returns the registered name.
    pub fn add_storage(&self, schema: StorageSchema) -> StorageName {
        self.core
            .registries
            .storages
            .register(schema.storage_name.clone(), schema)
    }

    /// Register a state schema; returns the registered name.
    pub fn add_state(&self, schema: StateSchema) -> StateName {
        self.core.registries.states.register(schema.state_name.clone(), schema)
    }

    // ── Configuration ─────────────────────────────────────────────────────

    /// Inject a logger sink.
    pub fn use_logger(&self, adapter: Arc<dyn LoggerAdapter>) {
        self.core.logger.use_adapter(adapter);
    }

    /// Apply a partial configuration overlay.
    pub fn set_config(&self, update: ConfigUpdate) {
        let mut config = self.core.config.write().expect("config lock poisoned");
        update.apply(&mut config);
        self.core.logger.sync_flags(&config);
    }

    // ── Sessions & connections ────────────────────────────────────────────

    async fn open_session(
        &self,
        client_id: &str,
        swarm_name: &str,
        mode: SessionMode,
        source: &str,
    ) -> Result<Arc<ClientSession>, SwarmError> {
        self.core.validation.validate_swarm(swarm_name, source)?;
        self.core
            .session_validation
            .add_session(client_id, swarm_name, mode)?;
        self.core.session_connection(client_id, swarm_name).await
    }

    /// Open (or re-attach to) a request/response session.
    pub async fn session(
        &self,
        client_id: impl Into<ClientId>,
        swarm_name: impl Into<SwarmName>,
    ) -> Result<SwarmSession, SwarmError> {
        let client_id = client_id.into();
        let swarm_name = swarm_name.into();
        let ctx = MethodContext::for_method("session", client_id.clone()).with_swarm(swarm_name.clone());
        with_method_context(ctx, async {
            let session = self
                .open_session(&client_id, &swarm_name, SessionMode::Session, "session")
                .await?;
            Ok(SwarmSession {
                handle: self.clone(),
                session,
                client_id,
                swarm_name,
                scheduled: None,
            })
        })
        .await
    }

    /// Like [`session`](AgentSwarm::session), but messages submitted
    /// within the delay window are batched into one turn.
    pub async fn session_scheduled(
        &self,
        client_id: impl Into<ClientId>,
        swarm_name: impl Into<SwarmName>,
        delay: Duration,
    ) -> Result<SwarmSession, SwarmError> {
        let client_id = client_id.into();
        let swarm_name = swarm_name.into();
        let ctx = MethodContext::for_method("session_scheduled", client_id.clone())
            .with_swarm(swarm_name.clone());
        with_method_context(ctx, async {
            let session = self
                .open_session(&client_id, &swarm_name, SessionMode::Scheduled, "session_scheduled")
                .await?;
            Ok(SwarmSession {
                handle: self.clone(),
                session,
                client_id,
                swarm_name,
                scheduled: Some(ScheduledBatch::new(delay)),
            })
        })
        .await
    }

    /// Bridge a bidirectional connector: `on_outgoing` is invoked with
    /// every produced output; the returned handle's `send` feeds incoming
    /// messages into turns.
    pub async fn make_connection(
        &self,
        on_outgoing: SessionSend,
        client_id: impl Into<ClientId>,
        swarm_name: impl Into<SwarmName>,
    ) -> Result<SwarmConnection, SwarmError> {
        let client_id = client_id.into();
        let swarm_name = swarm_name.into();
        let ctx = MethodContext::for_method("make_connection", client_id.clone())
            .with_swarm(swarm_name.clone());
        with_method_context(ctx, async {
            let session = self
                .open_session(
                    &client_id,
                    &swarm_name,
                    SessionMode::MakeConnection,
                    "make_connection",
                )
                .await?;
            let receive = session.connect(on_outgoing);
            Ok(SwarmConnection {
                handle: self.clone(),
                session,
                receive,
                client_id,
                swarm_name,
                scheduled: None,
            })
        })
        .await
    }

    /// [`make_connection`](AgentSwarm::make_connection) with delay-window
    /// batching of incoming messages.
    pub async fn make_connection_scheduled(
        &self,
        on_outgoing: SessionSend,
        client_id: impl Into<ClientId>,
        swarm_name: impl Into<SwarmName>,
        delay: Duration,
    ) -> Result<SwarmConnection, SwarmError> {
        let mut connection = self.make_connection(on_outgoing, client_id, swarm_name).await?;
        connection.scheduled = Some(ScheduledBatch::new(delay));
        Ok(connection)
    }

    /// One-shot completion: attach (or re-attach) the client and run one
    /// queued turn.
    pub async fn complete(
        &self,
        message: impl Into<String>,
        client_id: impl Into<ClientId>,
        swarm_name: impl Into<SwarmName>,
    ) -> Result<String, SwarmError> {
        let message = message.into();
        let client_id = client_id.into();
        let swarm_name = swarm_name.into();
        let ctx = MethodContext::for_method("complete", client_id.clone()).with_swarm(swarm_name.clone());
        with_method_context(ctx, async {
            let session = self
                .open_session(&client_id, &swarm_name, SessionMode::Complete, "complete")
                .await?;
            session.execute(&message, ExecutionMode::User).await
        })
        .await
    }

    /// Tear down everything built for the client's session.
    pub async fn dispose_connection(
        &self,
        client_id: impl Into<ClientId>,
        swarm_name: impl Into<SwarmName>,
    ) -> Result<(), SwarmError> {
        let client_id = client_id.into();
        let swarm_name = swarm_name.into();
        let ctx = MethodContext::for_method("dispose_connection", client_id.clone())
            .with_swarm(swarm_name.clone());
        with_method_context(ctx, async {
            self.core.dispose_connection(&client_id, &swarm_name).await
        })
        .await
    }

    // ── Turn-level operations ─────────────────────────────────────────────

    async fn swarm_for(&self, client_id: &str, source: &str) -> Result<Arc<ClientSwarm>, SwarmError> {
        self.core.session_validation.validate(client_id, source)?;
        let swarm_name = self.core.session_validation.swarm_of(client_id)?;
        self.core.swarm_connection(client_id, &swarm_name).await
    }

    async fn execute_impl(
        &self,
        message: &str,
        client_id: &str,
        guard_agent: Option<&str>,
    ) -> Result<String, SwarmError> {
        let swarm = self.swarm_for(client_id, "execute").await?;
        if let Some(agent_name) = guard_agent {
            if swarm.get_agent_name() != agent_name {
                return Ok(String::new());
            }
        }
        let wait = swarm.wait_for_output();
        let agent = swarm.get_agent()?;
        let mut turn = {
            let agent = Arc::clone(&agent);
            let message = message.to_string();
            tokio::spawn(async move { agent.execute(&message, ExecutionMode::Tool).await })
        };
        tokio::pin!(wait);
        tokio::select! {
            output = &mut wait => Ok(output),
            finished = &mut turn => match finished {
                Ok(Ok(())) => Ok(wait.await),
                Ok(Err(error)) => Err(error),
                Err(join_error) => {
                    Err(SwarmError::ExecutionFailed(format!("turn task: {}", join_error)))
                }
            },
        }
    }

    /// Run a turn on the active agent, provided `agent_name` still is the
    /// active agent (stale calls from superseded tools become no-ops and
    /// return the empty string).
    pub async fn execute(
        &self,
        message: impl Into<String>,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<String, SwarmError> {
        let message = message.into();
        let client_id = client_id.into();
        let agent_name = agent_name.into();
        let ctx = MethodContext::for_method("execute", client_id.clone()).with_agent(agent_name.clone());
        begin_scope(with_method_context(ctx, async {
            self.execute_impl(&message, &client_id, Some(&agent_name)).await
        }))
        .await
    }

    /// [`execute`](AgentSwarm::execute) without the active-agent guard.
    pub async fn execute_force(
        &self,
        message: impl Into<String>,
        client_id: impl Into<ClientId>,
    ) -> Result<String, SwarmError> {
        let message = message.into();
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("execute_force", client_id.clone());
        begin_scope(with_method_context(ctx, async {
            self.execute_impl(&message, &client_id, None).await
        }))
        .await
    }

    async fn run_impl(
        &self,
        message: &str,
        client_id: &str,
        guard_agent: Option<&str>,
    ) -> Result<String, SwarmError> {
        let swarm = self.swarm_for(client_id, "run").await?;
        if let Some(agent_name) = guard_agent {
            if swarm.get_agent_name() != agent_name {
                return Ok(String::new());
            }
        }
        swarm.get_agent()?.run(message).await
    }

    /// Stateless completion pass on the active agent.
    pub async fn run(
        &self,
        message: impl Into<String>,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<String, SwarmError> {
        let message = message.into();
        let client_id = client_id.into();
        let agent_name = agent_name.into();
        let ctx = MethodContext::for_method("run", client_id.clone()).with_agent(agent_name.clone());
        begin_scope(with_method_context(ctx, async {
            self.run_impl(&message, &client_id, Some(&agent_name)).await
        }))
        .await
    }

    /// [`run`](AgentSwarm::run) without the active-agent guard.
    pub async fn run_force(
        &self,
        message: impl Into<String>,
        client_id: impl Into<ClientId>,
    ) -> Result<String, SwarmError> {
        let message = message.into();
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("run_force", client_id.clone());
        begin_scope(with_method_context(ctx, async {
            self.run_impl(&message, &client_id, None).await
        }))
        .await
    }

    async fn emit_impl(
        &self,
        message: &str,
        client_id: &str,
        guard_agent: Option<&str>,
    ) -> Result<(), SwarmError> {
        self.core.session_validation.validate(client_id, "emit")?;
        if let Some(agent_name) = guard_agent {
            let swarm = self.swarm_for(client_id, "emit").await?;
            if swarm.get_agent_name() != agent_name {
                return Ok(());
            }
        }
        let swarm_name = self.core.session_validation.swarm_of(client_id)?;
        let session = self.core.session_connection(client_id, &swarm_name).await?;
        session.emit(message).await;
        Ok(())
    }

    /// Push `message` to the client's connector without running a turn.
    pub async fn emit(
        &self,
        message: impl Into<String>,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<(), SwarmError> {
        let message = message.into();
        let client_id = client_id.into();
        let agent_name = agent_name.into();
        let ctx = MethodContext::for_method("emit", client_id.clone()).with_agent(agent_name.clone());
        begin_scope(with_method_context(ctx, async {
            self.emit_impl(&message, &client_id, Some(&agent_name)).await
        }))
        .await
    }

    /// [`emit`](AgentSwarm::emit) without the active-agent guard.
    pub async fn emit_force(
        &self,
        message: impl Into<String>,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        let message = message.into();
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("emit_force", client_id.clone());
        begin_scope(with_method_context(ctx, async {
            self.emit_impl(&message, &client_id, None).await
        }))
        .await
    }

    async fn change_agent_impl(
        &self,
        agent_name: &str,
        client_id: &str,
        skip_noop_guard: bool,
    ) -> Result<(), SwarmError> {
        self.core.session_validation.validate(client_id, "change_agent")?;
        let swarm_name = self.core.session_validation.swarm_of(client_id)?;
        self.core
            .validation
            .validate_agent_in_swarm(agent_name, &swarm_name, "change_agent")?;
        let swarm = self.core.swarm_connection(client_id, &swarm_name).await?;
        if !skip_noop_guard && swarm.get_agent_name() == agent_name {
            return Ok(());
        }
        swarm.set_agent_name(agent_name).await
    }

    /// Make `agent_name` the active agent (no-op when already active).
    pub async fn change_agent(
        &self,
        agent_name: impl Into<AgentName>,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        let agent_name = agent_name.into();
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("change_agent", client_id.clone())
            .with_agent(agent_name.clone());
        begin_scope(with_method_context(ctx, async {
            self.change_agent_impl(&agent_name, &client_id, false).await
        }))
        .await
    }

    /// [`change_agent`](AgentSwarm::change_agent) without the
    /// already-active no-op guard: callbacks and persistence re-fire.
    pub async fn change_agent_force(
        &self,
        agent_name: impl Into<AgentName>,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        let agent_name = agent_name.into();
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("change_agent_force", client_id.clone())
            .with_agent(agent_name.clone());
        begin_scope(with_method_context(ctx, async {
            self.change_agent_impl(&agent_name, &client_id, true).await
        }))
        .await
    }

    /// Alias of [`change_agent`](AgentSwarm::change_agent).
    pub async fn change_to_agent(
        &self,
        agent_name: impl Into<AgentName>,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        self.change_agent(agent_name, client_id).await
    }

    /// Alias of [`change_agent_force`](AgentSwarm::change_agent_force).
    pub async fn change_to_agent_force(
        &self,
        agent_name: impl Into<AgentName>,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        self.change_agent_force(agent_name, client_id).await
    }

    /// Pop the navigation stack: the previously active agent (or the
    /// default agent when the stack is empty) becomes active.
    pub async fn change_to_prev_agent(
        &self,
        client_id: impl Into<ClientId>,
    ) -> Result<AgentName, SwarmError> {
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("change_to_prev_agent", client_id.clone());
        begin_scope(with_method_context(ctx, async {
            let swarm = self.swarm_for(&client_id, "change_to_prev_agent").await?;
            swarm.navigation_pop().await
        }))
        .await
    }

    async fn cancel_output_impl(
        &self,
        client_id: &str,
        guard_agent: Option<&str>,
    ) -> Result<(), SwarmError> {
        let swarm = self.swarm_for(client_id, "cancel_output").await?;
        if let Some(agent_name) = guard_agent {
            if swarm.get_agent_name() != agent_name {
                return Ok(());
            }
        }
        swarm.cancel_output();
        Ok(())
    }

    /// Resolve any pending output wait with the empty string.
    pub async fn cancel_output(
        &self,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<(), SwarmError> {
        let client_id = client_id.into();
        let agent_name = agent_name.into();
        let ctx = MethodContext::for_method("cancel_output", client_id.clone())
            .with_agent(agent_name.clone());
        begin_scope(with_method_context(ctx, async {
            self.cancel_output_impl(&client_id, Some(&agent_name)).await
        }))
        .await
    }

    /// [`cancel_output`](AgentSwarm::cancel_output) without the guard.
    pub async fn cancel_output_force(
        &self,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("cancel_output_force", client_id.clone());
        begin_scope(with_method_context(ctx, async {
            self.cancel_output_impl(&client_id, None).await
        }))
        .await
    }

    // ── Commits ───────────────────────────────────────────────────────────

    async fn session_for(&self, client_id: &str, source: &str) -> Result<Arc<ClientSession>, SwarmError> {
        self.core.session_validation.validate(client_id, source)?;
        let swarm_name = self.core.session_validation.swarm_of(client_id)?;
        self.core.session_connection(client_id, &swarm_name).await
    }

    async fn guard_active(
        &self,
        client_id: &str,
        guard_agent: Option<&str>,
        source: &str,
    ) -> Result<bool, SwarmError> {
        let Some(agent_name) = guard_agent else {
            return Ok(true);
        };
        let swarm = self.swarm_for(client_id, source).await?;
        Ok(swarm.get_agent_name() == agent_name)
    }

    async fn commit_scoped<F, Fut>(
        &self,
        method: &str,
        client_id: ClientId,
        agent_name: Option<AgentName>,
        body: F,
    ) -> Result<(), SwarmError>
    where
        F: FnOnce(Arc<ClientSession>) -> Fut,
        Fut: std::future::Future<Output = Result<(), SwarmError>>,
    {
        let mut ctx = MethodContext::for_method(method, client_id.clone());
        if let Some(agent_name) = &agent_name {
            ctx = ctx.with_agent(agent_name.clone());
        }
        begin_scope(with_method_context(ctx, async {
            if !self
                .guard_active(&client_id, agent_name.as_deref(), method)
                .await?
            {
                return Ok(());
            }
            let session = self.session_for(&client_id, method).await?;
            body(session).await
        }))
        .await
    }

    /// Append a tool result for `tool_id` and release the tool chain.
    pub async fn commit_tool_output(
        &self,
        tool_id: impl Into<ToolCallId>,
        content: impl Into<String>,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<(), SwarmError> {
        let tool_id = tool_id.into();
        let content = content.into();
        self.commit_scoped(
            "commit_tool_output",
            client_id.into(),
            Some(agent_name.into()),
            |session| async move { session.commit_tool_output(&tool_id, &content).await },
        )
        .await
    }

    /// [`commit_tool_output`](AgentSwarm::commit_tool_output) without the
    /// active-agent guard.
    pub async fn commit_tool_output_force(
        &self,
        tool_id: impl Into<ToolCallId>,
        content: impl Into<String>,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        let tool_id = tool_id.into();
        let content = content.into();
        self.commit_scoped(
            "commit_tool_output_force",
            client_id.into(),
            None,
            |session| async move { session.commit_tool_output(&tool_id, &content).await },
        )
        .await
    }

    /// Append a system message to the active agent's history.
    pub async fn commit_system_message(
        &self,
        content: impl Into<String>,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<(), SwarmError> {
        let content = content.into();
        self.commit_scoped(
            "commit_system_message",
            client_id.into(),
            Some(agent_name.into()),
            |session| async move { session.commit_system_message(&content).await },
        )
        .await
    }

    pub async fn commit_system_message_force(
        &self,
        content: impl Into<String>,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        let content = content.into();
        self.commit_scoped(
            "commit_system_message_force",
            client_id.into(),
            None,
            |session| async move { session.commit_system_message(&content).await },
        )
        .await
    }

    /// Append a user message without triggering a completion.
    pub async fn commit_user_message(
        &self,
        content: impl Into<String>,
        mode: ExecutionMode,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<(), SwarmError> {
        let content = content.into();
        self.commit_scoped(
            "commit_user_message",
            client_id.into(),
            Some(agent_name.into()),
            |session| async move { session.commit_user_message(&content, mode).await },
        )
        .await
    }

    pub async fn commit_user_message_force(
        &self,
        content: impl Into<String>,
        mode: ExecutionMode,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        let content = content.into();
        self.commit_scoped(
            "commit_user_message_force",
            client_id.into(),
            None,
            |session| async move { session.commit_user_message(&content, mode).await },
        )
        .await
    }

    /// Append an assistant message without triggering a completion.
    pub async fn commit_assistant_message(
        &self,
        content: impl Into<String>,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<(), SwarmError> {
        let content = content.into();
        self.commit_scoped(
            "commit_assistant_message",
            client_id.into(),
            Some(agent_name.into()),
            |session| async move { session.commit_assistant_message(&content).await },
        )
        .await
    }

    pub async fn commit_assistant_message_force(
        &self,
        content: impl Into<String>,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        let content = content.into();
        self.commit_scoped(
            "commit_assistant_message_force",
            client_id.into(),
            None,
            |session| async move { session.commit_assistant_message(&content).await },
        )
        .await
    }

    /// Append a flush marker to the active agent's history.
    pub async fn commit_flush(
        &self,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<(), SwarmError> {
        self.commit_scoped(
            "commit_flush",
            client_id.into(),
            Some(agent_name.into()),
            |session| async move { session.commit_flush().await },
        )
        .await
    }

    pub async fn commit_flush_force(
        &self,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        self.commit_scoped("commit_flush_force", client_id.into(), None, |session| async move {
            session.commit_flush().await
        })
        .await
    }

    /// Halt the active agent's running tool chain.
    pub async fn commit_stop_tools(
        &self,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<(), SwarmError> {
        self.commit_scoped(
            "commit_stop_tools",
            client_id.into(),
            Some(agent_name.into()),
            |session| async move { session.commit_stop_tools().await },
        )
        .await
    }

    pub async fn commit_stop_tools_force(
        &self,
        client_id: impl Into<ClientId>,
    ) -> Result<(), SwarmError> {
        self.commit_scoped("commit_stop_tools_force", client_id.into(), None, |session| async move {
            session.commit_stop_tools().await
        })
        .await
    }

    // ── Event listeners ───────────────────────────────────────────────────

    /// Listen to agent events for `client_id` (or `"*"`).
    pub fn listen_agent_event(&self, client_id: impl Into<ClientId>, listener: BusListener) -> BusSubscription {
        self.core.bus.subscribe(client_id, EventSource::AgentBus, listener)
    }

    pub fn listen_session_event(&self, client_id: impl Into<ClientId>, listener: BusListener) -> BusSubscription {
        self.core.bus.subscribe(client_id, EventSource::SessionBus, listener)
    }

    pub fn listen_history_event(&self, client_id: impl Into<ClientId>, listener: BusListener) -> BusSubscription {
        self.core.bus.subscribe(client_id, EventSource::HistoryBus, listener)
    }

    pub fn listen_storage_event(&self, client_id: impl Into<ClientId>, listener: BusListener) -> BusSubscription {
        self.core.bus.subscribe(client_id, EventSource::StorageBus, listener)
    }

    pub fn listen_state_event(&self, client_id: impl Into<ClientId>, listener: BusListener) -> BusSubscription {
        self.core.bus.subscribe(client_id, EventSource::StateBus, listener)
    }

    pub fn listen_swarm_event(&self, client_id: impl Into<ClientId>, listener: BusListener) -> BusSubscription {
        self.core.bus.subscribe(client_id, EventSource::SwarmBus, listener)
    }

    /// One-shot agent event listener gated by `filter`.
    pub fn listen_agent_event_once(
        &self,
        client_id: impl Into<ClientId>,
        filter: BusFilter,
        listener: BusListener,
    ) -> BusSubscription {
        self.core.bus.once(client_id, EventSource::AgentBus, filter, listener)
    }

    pub fn listen_session_event_once(
        &self,
        client_id: impl Into<ClientId>,
        filter: BusFilter,
        listener: BusListener,
    ) -> BusSubscription {
        self.core.bus.once(client_id, EventSource::SessionBus, filter, listener)
    }

    pub fn listen_history_event_once(
        &self,
        client_id: impl Into<ClientId>,
        filter: BusFilter,
        listener: BusListener,
    ) -> BusSubscription {
        self.core.bus.once(client_id, EventSource::HistoryBus, filter, listener)
    }

    pub fn listen_storage_event_once(
        &self,
        client_id: impl Into<ClientId>,
        filter: BusFilter,
        listener: BusListener,
    ) -> BusSubscription {
        self.core.bus.once(client_id, EventSource::StorageBus, filter, listener)
    }

    pub fn listen_state_event_once(
        &self,
        client_id: impl Into<ClientId>,
        filter: BusFilter,
        listener: BusListener,
    ) -> BusSubscription {
        self.core.bus.once(client_id, EventSource::StateBus, filter, listener)
    }

    pub fn listen_swarm_event_once(
        &self,
        client_id: impl Into<ClientId>,
        filter: BusFilter,
        listener: BusListener,
    ) -> BusSubscription {
        self.core.bus.once(client_id, EventSource::SwarmBus, filter, listener)
    }

    // ── History inspection ────────────────────────────────────────────────

    async fn active_history_raw(&self, client_id: &str, source: &str) -> Result<Vec<ModelMessage>, SwarmError> {
        let swarm = self.swarm_for(client_id, source).await?;
        let agent = swarm.get_agent()?;
        Ok(agent.history().to_array_for_raw().await)
    }

    /// The active agent's entire log, unfiltered.
    pub async fn get_raw_history(&self, client_id: impl Into<ClientId>) -> Result<Vec<ModelMessage>, SwarmError> {
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("get_raw_history", client_id.clone());
        with_method_context(ctx, async { self.active_history_raw(&client_id, "get_raw_history").await })
            .await
    }

    /// The completion projection of `agent_name`'s history: prompt/system
    /// preamble plus the filtered, truncated log.
    pub async fn get_agent_history(
        &self,
        client_id: impl Into<ClientId>,
        agent_name: impl Into<AgentName>,
    ) -> Result<Vec<ModelMessage>, SwarmError> {
        let client_id = client_id.into();
        let agent_name = agent_name.into();
        let ctx = MethodContext::for_method("get_agent_history", client_id.clone())
            .with_agent(agent_name.clone());
        with_method_context(ctx, async {
            let schema = self.core.registries.agents.get(&agent_name).ok_or_else(|| {
                SwarmError::SchemaNotFound {
                    kind: "agent",
                    name: agent_name.clone(),
                    source: "get_agent_history".to_string(),
                }
            })?;
            let (keep, filter) = {
                let config = self.core.config.read().expect("config lock poisoned");
                (config.keep_messages, config.history_filter.clone())
            };
            let history = self.core.history_connection(&client_id, &agent_name);
            Ok(history
                .to_array_for_agent(&schema.prompt, &schema.system, keep, filter.as_ref())
                .await)
        })
        .await
    }

    /// Human-entered user messages of the active agent's log.
    pub async fn get_user_history(&self, client_id: impl Into<ClientId>) -> Result<Vec<ModelMessage>, SwarmError> {
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("get_user_history", client_id.clone());
        with_method_context(ctx, async {
            Ok(self
                .active_history_raw(&client_id, "get_user_history")
                .await?
                .into_iter()
                .filter(|msg| msg.role == MessageRole::User && msg.mode == ExecutionMode::User)
                .collect())
        })
        .await
    }

    /// Assistant messages of the active agent's log.
    pub async fn get_assistant_history(
        &self,
        client_id: impl Into<ClientId>,
    ) -> Result<Vec<ModelMessage>, SwarmError> {
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("get_assistant_history", client_id.clone());
        with_method_context(ctx, async {
            Ok(self
                .active_history_raw(&client_id, "get_assistant_history")
                .await?
                .into_iter()
                .filter(|msg| msg.role == MessageRole::Assistant)
                .collect())
        })
        .await
    }

    pub async fn get_last_user_message(
        &self,
        client_id: impl Into<ClientId>,
    ) -> Result<Option<String>, SwarmError> {
        Ok(self
            .get_user_history(client_id)
            .await?
            .pop()
            .map(|msg| msg.content))
    }

    pub async fn get_last_assistant_message(
        &self,
        client_id: impl Into<ClientId>,
    ) -> Result<Option<String>, SwarmError> {
        Ok(self
            .get_assistant_history(client_id)
            .await?
            .pop()
            .map(|msg| msg.content))
    }

    pub async fn get_last_system_message(
        &self,
        client_id: impl Into<ClientId>,
    ) -> Result<Option<String>, SwarmError> {
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("get_last_system_message", client_id.clone());
        with_method_context(ctx, async {
            Ok(self
                .active_history_raw(&client_id, "get_last_system_message")
                .await?
                .into_iter()
                .rev()
                .find(|msg| msg.role == MessageRole::System)
                .map(|msg| msg.content))
        })
        .await
    }

    // ── Introspection ─────────────────────────────────────────────────────

    /// How the client's session was established.
    pub fn get_session_mode(&self, client_id: &str) -> Result<SessionMode, SwarmError> {
        self.core.session_validation.mode_of(client_id)
    }

    /// Name of the client's active agent.
    pub async fn get_agent_name(&self, client_id: impl Into<ClientId>) -> Result<AgentName, SwarmError> {
        let client_id = client_id.into();
        let ctx = MethodContext::for_method("get_agent_name", client_id.clone());
        with_method_context(ctx, async {
            let swarm = self.swarm_for(&client_id, "get_agent_name").await?;
            Ok(swarm.get_agent_name())
        })
        .await
    }

    /// Snapshot of the ambient method/execution contexts plus the process
    /// id. Reads the contexts active at the call site.
    pub fn get_session_context(&self) -> SessionContext {
        let method_context = method_context();
        let execution_context = execution_context();
        let client_id = execution_context
            .as_ref()
            .map(|ctx| ctx.client_id.clone())
            .or_else(|| method_context.as_ref().map(|ctx| ctx.client_id.clone()));
        SessionContext {
            client_id,
            process_id: PROCESS_UUID.clone(),
            method_context,
            execution_context,
        }
    }

    // ── Auto-dispose ──────────────────────────────────────────────────────

    /// Inactivity-driven teardown: when no [`tick`](AutoDispose::tick)
    /// arrives for `timeout`, the client's connection is disposed and
    /// `on_destroy` fires.
    pub fn make_auto_dispose(
        &self,
        client_id: impl Into<ClientId>,
        swarm_name: impl Into<SwarmName>,
        timeout: Duration,
        on_destroy: Option<Arc<dyn Fn(&ClientId, &SwarmName) + Send + Sync>>,
    ) -> AutoDispose {
        let client_id = client_id.into();
        let swarm_name = swarm_name.into();
        let last_tick = Arc::new(StdMutex::new(Instant::now()));
        let stop = Arc::new(Notify::new());
        let destroyed = Arc::new(AtomicBool::new(false));

        let handle = self.clone();
        let task_last_tick = Arc::clone(&last_tick);
        let task_stop = Arc::clone(&stop);
        let task_destroyed = Arc::clone(&destroyed);
        let task_client = client_id.clone();
        let task_swarm = swarm_name.clone();
        tokio::spawn(async move {
            let poll = Duration::from_secs(1).min(timeout.max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = task_stop.notified() => return,
                    _ = tokio::time::sleep(poll) => {}
                }
                let idle = task_last_tick
                    .lock()
                    .expect("auto-dispose tick lock poisoned")
                    .elapsed();
                if idle >= timeout {
                    task_destroyed.store(true, Ordering::SeqCst);
                    if let Err(error) = handle.dispose_connection(&task_client, &task_swarm).await {
                        log::warn!("auto-dispose of {} failed: {}", task_client, error);
                    }
                    if let Some(on_destroy) = &on_destroy {
                        on_destroy(&task_client, &task_swarm);
                    }
                    return;
                }
            }
        });

        AutoDispose {
            handle: self.clone(),
            client_id,
            swarm_name,
            last_tick,
            stop,
            destroyed,
        }
    }

    // ── Storage & state ───────────────────────────────────────────────────

    async fn declared_storage(
        &self,
        client_id: &str,
        storage_name: &str,
        source: &str,
    ) -> Result<Arc<ClientStorage>, SwarmError> {
        self.core.session_validation.validate(client_id, source)?;
        let swarm_name = self.core.session_validation.swarm_of(client_id)?;
        let swarm = self.core.swarm_connection(client_id, &swarm_name).await?;
        let agent_name = swarm.get_agent_name();
        let schema = self.core.registries.agents.get(&agent_name).ok_or_else(|| {
            SwarmError::SchemaNotFound {
                kind: "agent",
                name: agent_name.clone(),
                source: source.to_string(),
            }
        })?;
        if !schema.storages.iter().any(|name| name == storage_name) {
            return Err(SwarmError::ResourceNotDeclared {
                agent_name,
                kind: "storage",
                name: storage_name.to_string(),
            });
        }
        self.core.storage_connection(client_id, storage_name).await
    }

    /// Similarity search over the named storage.
    pub async fn storage_take(
        &self,
        search: impl Into<String>,
        total: usize,
        client_id: impl Into<ClientId>,
        storage_name: impl Into<StorageName>,
    ) -> Result<Vec<StorageItem>, SwarmError> {
        let search = search.into();
        let client_id = client_id.into();
        let storage_name = storage_name.into();
        let ctx = MethodContext::for_method("storage_take", client_id.clone())
            .with_storage(storage_name.clone());
        with_method_context(ctx, async {
            let storage = self
                .declared_storage(&client_id, &storage_name, "storage_take")
                .await?;
            storage.take(&search, total).await
        })
        .await
    }

    pub async fn storage_upsert(
        &self,
        item: StorageItem,
        client_id: impl Into<ClientId>,
        storage_name: impl Into<StorageName>,
    ) -> Result<(), SwarmError> {
        let client_id = client_id.into();
        let storage_name = storage_name.into();
        let ctx = MethodContext::for_method("storage_upsert", client_id.clone())
            .with_storage(storage_name.clone());
        with_method_context(ctx, async {
            let storage = self
                .declared_storage(&client_id, &storage_name, "storage_upsert")
                .await?;
            storage.upsert(item).await
        })
        .await
    }

    pub async fn storage_remove(
        &self,
        id: ItemId,
        client_id: impl Into<ClientId>,
        storage_name: impl Into<StorageName>,
    ) -> Result<(), SwarmError> {
        let client_id = client_id.into();
        let storage_name = storage_name.into();
        let ctx = MethodContext::for_method("storage_remove", client_id.clone())
            .with_storage(storage_name.clone());
        with_method_context(ctx, async {
            let storage = self
                .declared_storage(&client_id, &storage_name, "storage_remove")
                .await?;
            storage.remove(&id).await
        })
        .await
    }

    pub async fn storage_get(
        &self,
        id: ItemId,
        client_id: impl Into<ClientId>,
        storage_name: impl Into<StorageName>,
    ) -> Result<Option<StorageItem>, SwarmError> {
        let client_id = client_id.into();
        let storage_name = storage_name.into();
        let ctx = MethodContext::for_method("storage_get", client_id.clone())
            .with_storage(storage_name.clone());
        with_method_context(ctx, async {
            let storage = self
                .declared_storage(&client_id, &storage_name, "storage_get")
                .await?;
            Ok(storage.get(&id).await)
        })
        .await
    }

    pub async fn storage_list(
        &self,
        client_id: impl Into<ClientId>,
        storage_name: impl Into<StorageName>,
    ) -> Result<Vec<StorageItem>, SwarmError> {
        let client_id = client_id.into();
        let storage_name = storage_name.into();
        let ctx = MethodContext::for_method("storage_list", client_id.clone())
            .with_storage(storage_name.clone());
        with_method_context(ctx, async {
            let storage = self
                .declared_storage(&client_id, &storage_name, "storage_list")
                .await?;
            Ok(storage.list().await)
        })
        .await
    }

    pub async fn storage_clear(
        &self,
        client_id: impl Into<ClientId>,
        storage_name: impl Into<StorageName>,
    ) -> Result<(), SwarmError> {
        let client_id = client_id.into();
        let storage_name = storage_name.into();
        let ctx = MethodContext::for_method("storage_clear", client_id.clone())
            .with_storage(storage_name.clone());
        with_method_context(ctx, async {
            let storage = self
                .declared_storage(&client_id, &storage_name, "storage_clear")
                .await?;
            storage.clear().await
        })
        .await
    }

    async fn declared_state(
        &self,
        client_id: &str,
        state_name: &str,
        source: &str,
    ) -> Result<Arc<crate::swarm::state::ClientState>, SwarmError> {
        self.core.session_validation.validate(client_id, source)?;
        let swarm_name = self.core.session_validation.swarm_of(client_id)?;
        let swarm = self.core.swarm_connection(client_id, &swarm_name).await?;
        let agent_name = swarm.get_agent_name();
        let schema = self.core.registries.agents.get(&agent_name).ok_or_else(|| {
            SwarmError::SchemaNotFound {
                kind: "agent",
                name: agent_name.clone(),
                source: source.to_string(),
            }
        })?;
        if !schema.states.iter().any(|name| name == state_name) {
            return Err(SwarmError::ResourceNotDeclared {
                agent_name,
                kind: "state",
                name: state_name.to_string(),
            });
        }
        self.core.state_connection(client_id, state_name).await
    }

    pub async fn state_get(
        &self,
        client_id: impl Into<ClientId>,
        state_name: impl Into<StateName>,
    ) -> Result<StateValue, SwarmError> {
        let client_id = client_id.into();
        let state_name = state_name.into();
        let ctx =
            MethodContext::for_method("state_get", client_id.clone()).with_state(state_name.clone());
        with_method_context(ctx, async {
            let state = self.declared_state(&client_id, &state_name, "state_get").await?;
            Ok(state.get_state().await)
        })
        .await
    }

    pub async fn state_set(
        &self,
        value: StateValue,
        client_id: impl Into<ClientId>,
        state_name: impl Into<StateName>,
    ) -> Result<StateValue, SwarmError> {
        let client_id = client_id.into();
        let state_name = state_name.into();
        let ctx =
            MethodContext::for_method("state_set", client_id.clone()).with_state(state_name.clone());
        with_method_context(ctx, async {
            let state = self.declared_state(&client_id, &state_name, "state_set").await?;
            state.set_state(value).await
        })
        .await
    }

    pub async fn state_update<F>(
        &self,
        dispatch: F,
        client_id: impl Into<ClientId>,
        state_name: impl Into<StateName>,
    ) -> Result<StateValue, SwarmError>
    where
        F: FnOnce(StateValue) -> StateValue,
    {
        let client_id = client_id.into();
        let state_name = state_name.into();
        let ctx =
            MethodContext::for_method("state_update", client_id.clone()).with_state(state_name.clone());
        with_method_context(ctx, async {
            let state = self
                .declared_state(&client_id, &state_name, "state_update")
                .await?;
            state.update_state(dispatch).await
        })
        .await
    }
}

impl Default for AgentSwarm {
    fn default() -> Self {
        Self::new()
    }
}

// ── Handles ───────────────────────────────────────────────────────────────

/// Messages queued inside one delay window, batched into a single turn.
#[derive(Clone)]
struct ScheduledBatch {
    delay: Duration,
    pending: Arc<StdMutex<Vec<String>>>,
    result: Arc<Signal<String>>,
}

impl ScheduledBatch {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(StdMutex::new(Vec::new())),
            result: Arc::new(Signal::new()),
        }
    }

    /// Enqueue `message`; the first message of a window elects the caller
    /// as the window's leader who runs the batched turn.
    async fn submit<F, Fut>(&self, message: String, run: F) -> Result<String, SwarmError>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<String, SwarmError>>,
    {
        let leader = {
            let mut pending = self.pending.lock().expect("batch lock poisoned");
            let was_empty = pending.is_empty();
            pending.push(message);
            was_empty
        };
        if leader {
            tokio::time::sleep(self.delay).await;
            let joined = {
                let mut pending = self.pending.lock().expect("batch lock poisoned");
                pending.drain(..).collect::<Vec<_>>().join("\n")
            };
            let output = run(joined).await?;
            self.result.publish(output.clone());
            Ok(output)
        } else {
            let mut waiter = self.result.subscribe();
            Ok(waiter.recv().await)
        }
    }
}

/// Handle returned by [`AgentSwarm::session`].
pub struct SwarmSession {
    handle: AgentSwarm,
    session: Arc<ClientSession>,
    client_id: ClientId,
    swarm_name: SwarmName,
    scheduled: Option<ScheduledBatch>,
}

impl SwarmSession {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Run one queued turn and return its output.
    pub async fn complete(&self, message: impl Into<String>) -> Result<String, SwarmError> {
        let message = message.into();
        let ctx = MethodContext::for_method("session.complete", self.client_id.clone())
            .with_swarm(self.swarm_name.clone());
        with_method_context(ctx, async {
            match &self.scheduled {
                None => self.session.execute(&message, ExecutionMode::User).await,
                Some(batch) => {
                    batch
                        .submit(message, |joined| async move {
                            self.session.execute(&joined, ExecutionMode::User).await
                        })
                        .await
                }
            }
        })
        .await
    }

    pub async fn dispose(&self) -> Result<(), SwarmError> {
        self.handle
            .dispose_connection(self.client_id.clone(), self.swarm_name.clone())
            .await
    }
}

/// Handle returned by [`AgentSwarm::make_connection`].
pub struct SwarmConnection {
    handle: AgentSwarm,
    session: Arc<ClientSession>,
    receive: SessionReceive,
    client_id: ClientId,
    swarm_name: SwarmName,
    pub(crate) scheduled: Option<ScheduledBatch>,
}

impl SwarmConnection {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Feed an incoming client message into the session. The produced
    /// output travels through the connector's send callback.
    pub async fn send(&self, message: impl Into<String>) -> Result<(), SwarmError> {
        let message = message.into();
        match &self.scheduled {
            None => {
                (self.receive)(message).await?;
                Ok(())
            }
            Some(batch) => {
                let receive = Arc::clone(&self.receive);
                batch
                    .submit(message, |joined| async move { receive(joined).await })
                    .await?;
                Ok(())
            }
        }
    }

    /// Server-side push to the connector, bypassing turn execution.
    pub async fn emit(&self, message: impl Into<String>) {
        self.session.emit(&message.into()).await;
    }

    pub async fn dispose(&self) -> Result<(), SwarmError> {
        self.handle
            .dispose_connection(self.client_id.clone(), self.swarm_name.clone())
            .await
    }
}

/// Handle returned by [`AgentSwarm::make_auto_dispose`].
pub struct AutoDispose {
    handle: AgentSwarm,
    client_id: ClientId,
    swarm_name: SwarmName,
    last_tick: Arc<StdMutex<Instant>>,
    stop: Arc<Notify>,
    destroyed: Arc<AtomicBool>,
}

impl AutoDispose {
    /// Record client activity, postponing the teardown deadline.
    pub fn tick(&self) {
        *self
            .last_tick
            .lock()
            .expect("auto-dispose tick lock poisoned") = Instant::now();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Stop the watchdog and dispose the connection immediately.
    pub async fn destroy(&self) -> Result<(), SwarmError> {
        self.stop.notify_waiters();
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.handle
                .dispose_connection(self.client_id.clone(), self.swarm_name.clone())
                .await?;
        }
        Ok(())
    }
}
