//! Per-client message gateway.
//!
//! A [`ClientSession`] is the serialization point of a client: `execute`
//! and `run` acquire the session's FIFO queue (a fair async mutex), so
//! concurrent calls for the same client linearize while different clients
//! proceed independently. Commits delegate straight to the active agent
//! *without* queueing — they are issued by tools running inside a queued
//! turn, and taking the queue again would deadlock the turn that spawned
//! them.
//!
//! [`connect`](ClientSession::connect) bridges a bidirectional connector:
//! the returned receive callback feeds incoming messages into `execute`,
//! while a background loop forwards every turn output and every
//! server-side [`emit`](ClientSession::emit) to the connector's send
//! callback.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, Notify};

use crate::swarm::bus::{BusEvent, EventBus, EventContext, EventSource};
use crate::swarm::client_swarm::ClientSwarm;
use crate::swarm::error::SwarmError;
use crate::swarm::logger::SwarmLogger;
use crate::swarm::signal::Signal;
use crate::swarm::types::{AgentName, ClientId, ExecutionMode, SwarmName, ToolCallId};

/// Payload handed to a connector's send callback.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: String,
    pub agent_name: AgentName,
    pub client_id: ClientId,
}

/// Connector-side send callback, invoked for every outgoing message.
pub type SessionSend = Arc<dyn Fn(OutgoingMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`SessionSend`].
pub fn outgoing<F, Fut>(f: F) -> SessionSend
where
    F: Fn(OutgoingMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}
/// Incoming-message callback returned by [`ClientSession::connect`].
pub type SessionReceive =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, SwarmError>> + Send + Sync>;

pub struct ClientSession {
    client_id: ClientId,
    swarm_name: SwarmName,
    swarm: Arc<ClientSwarm>,
    queue: Mutex<()>,
    emit_signal: Arc<Signal<String>>,
    shutdown: Arc<Notify>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    bus: EventBus,
    logger: SwarmLogger,
}

impl ClientSession {
    pub fn new(
        client_id: impl Into<ClientId>,
        swarm_name: impl Into<SwarmName>,
        swarm: Arc<ClientSwarm>,
        bus: EventBus,
        logger: SwarmLogger,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            swarm_name: swarm_name.into(),
            swarm,
            queue: Mutex::new(()),
            emit_signal: Arc::new(Signal::new()),
            shutdown: Arc::new(Notify::new()),
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            bus,
            logger,
        }
    }

    pub fn swarm(&self) -> &Arc<ClientSwarm> {
        &self.swarm
    }

    async fn emit_session_event(&self, kind: &str, input: serde_json::Value) {
        self.bus
            .emit(
                &self.client_id,
                BusEvent::new(EventSource::SessionBus, self.client_id.clone(), kind)
                    .with_input(input)
                    .with_context(EventContext {
                        swarm_name: Some(self.swarm_name.clone()),
                        ..EventContext::default()
                    }),
            )
            .await;
    }

    /// Run one queued turn on the active agent and return its output.
    pub async fn execute(&self, message: &str, mode: ExecutionMode) -> Result<String, SwarmError> {
        let _queued = self.queue.lock().await;
        self.logger.debug(
            &self.client_id,
            "session execute",
            serde_json::json!({"swarm": self.swarm_name}),
        );
        self.emit_session_event("execute", serde_json::json!(message)).await;

        // subscribe before the turn starts so an output emitted by a
        // navigated-to agent mid-turn is not missed
        let wait = self.swarm.wait_for_output();
        let agent = self.swarm.get_agent()?;
        let mut turn = {
            let agent = Arc::clone(&agent);
            let message = message.to_string();
            tokio::spawn(async move { agent.execute(&message, mode).await })
        };
        tokio::pin!(wait);

        // race the turn against the output: a cancelled wait resolves with
        // the empty string while the turn keeps running detached
        let output = tokio::select! {
            output = &mut wait => output,
            finished = &mut turn => match finished {
                Ok(Ok(())) => wait.await,
                Ok(Err(error)) => return Err(error),
                Err(join_error) => {
                    return Err(SwarmError::ExecutionFailed(format!("turn task: {}", join_error)))
                }
            },
        };

        self.emit_session_event("execute-done", serde_json::json!(output)).await;
        Ok(output)
    }

    /// Queued stateless completion pass on the active agent.
    pub async fn run(&self, message: &str) -> Result<String, SwarmError> {
        let _queued = self.queue.lock().await;
        self.emit_session_event("run", serde_json::json!(message)).await;
        let agent = self.swarm.get_agent()?;
        agent.run(message).await
    }

    // ── Commit delegates (unqueued) ───────────────────────────────────────

    pub async fn commit_tool_output(
        &self,
        tool_id: &ToolCallId,
        content: &str,
    ) -> Result<(), SwarmError> {
        self.swarm.get_agent()?.commit_tool_output(tool_id, content).await;
        Ok(())
    }

    pub async fn commit_system_message(&self, content: &str) -> Result<(), SwarmError> {
        self.swarm.get_agent()?.commit_system_message(content).await;
        Ok(())
    }

    pub async fn commit_user_message(
        &self,
        content: &str,
        mode: ExecutionMode,
    ) -> Result<(), SwarmError> {
        self.swarm.get_agent()?.commit_user_message(content, mode).await;
        Ok(())
    }

    pub async fn commit_assistant_message(&self, content: &str) -> Result<(), SwarmError> {
        self.swarm.get_agent()?.commit_assistant_message(content).await;
        Ok(())
    }

    pub async fn commit_flush(&self) -> Result<(), SwarmError> {
        self.swarm.get_agent()?.commit_flush().await;
        Ok(())
    }

    pub async fn commit_stop_tools(&self) -> Result<(), SwarmError> {
        self.swarm.get_agent()?.commit_stop_tools().await;
        Ok(())
    }

    /// Server-side push: deliver `message` to the connector without
    /// running a turn.
    pub async fn emit(&self, message: &str) {
        self.emit_session_event("emit", serde_json::json!(message)).await;
        self.emit_signal.publish(message.to_string());
    }

    /// Bridge a bidirectional connector.
    ///
    /// Spawns a background loop forwarding every swarm output and every
    /// [`emit`](ClientSession::emit) to `send`; returns the receive
    /// callback that feeds incoming messages into queued turns.
    pub fn connect(self: &Arc<Self>, send: SessionSend) -> SessionReceive {
        let session = Arc::clone(self);
        let mut output = self.swarm.output_waiter();
        let mut emitted = self.emit_signal.subscribe();
        let shutdown = Arc::clone(&self.shutdown);
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            loop {
                if closed.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                let data = tokio::select! {
                    _ = shutdown.notified() => break,
                    value = output.recv() => value,
                    value = emitted.recv() => value,
                };
                let message = OutgoingMessage {
                    data,
                    agent_name: session.swarm.get_agent_name(),
                    client_id: session.client_id.clone(),
                };
                send(message).await;
            }
        });

        let session = Arc::clone(self);
        Arc::new(move |incoming: String| {
            let session = Arc::clone(&session);
            Box::pin(async move { session.execute(&incoming, ExecutionMode::User).await })
        })
    }

    pub async fn dispose(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.shutdown.notify_waiters();
        self.swarm.cancel_output();
        self.emit_session_event("dispose", serde_json::Value::Null).await;
    }
}
