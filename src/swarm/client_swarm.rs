//! Per-client swarm controller.
//!
//! A [`ClientSwarm`] tracks which agent of the swarm is active for one
//! client, maintains the navigation stack (push on navigate-to, pop on
//! navigate-back) and owns the output plumbing the session layer waits on.
//!
//! Agents hold no back-reference to the swarm. Transitions are signaled by
//! the swarm to the *outgoing* agent via `commit_agent_change`, which halts
//! any tool chain that agent is still dispatching; every agent's output
//! signal is forwarded into one swarm-level output channel, so a pending
//! [`wait_for_output`](ClientSwarm::wait_for_output) observes the answer
//! regardless of which agent ends up producing it.
//!
//! Active agent and navigation stack survive restarts through the
//! configured [`SwarmPersistAdapter`] when the schema opts in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::swarm::bus::{BusEvent, EventBus, EventContext, EventSource};
use crate::swarm::client_agent::ClientAgent;
use crate::swarm::error::SwarmError;
use crate::swarm::logger::SwarmLogger;
use crate::swarm::persist::SwarmPersistAdapter;
use crate::swarm::schema::SwarmSchema;
use crate::swarm::signal::{Signal, SignalWaiter};
use crate::swarm::types::{AgentName, ClientId};

pub struct ClientSwarm {
    client_id: ClientId,
    schema: Arc<SwarmSchema>,
    agents: RwLock<HashMap<AgentName, Arc<ClientAgent>>>,
    active: RwLock<AgentName>,
    nav_stack: Mutex<Vec<AgentName>>,
    /// Fired with the new active agent name on every switch.
    agent_changed: Arc<Signal<AgentName>>,
    /// Fired with the empty string to cancel a pending output wait.
    cancel: Arc<Signal<String>>,
    /// Swarm-level output channel fed by every registered agent.
    output: Arc<Signal<String>>,
    forwarders: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    persist: Option<Arc<dyn SwarmPersistAdapter>>,
    bus: EventBus,
    logger: SwarmLogger,
}

impl ClientSwarm {
    pub fn new(
        client_id: impl Into<ClientId>,
        schema: Arc<SwarmSchema>,
        persist: Option<Arc<dyn SwarmPersistAdapter>>,
        bus: EventBus,
        logger: SwarmLogger,
    ) -> Self {
        let active = schema.default_agent.clone();
        Self {
            client_id: client_id.into(),
            schema,
            agents: RwLock::new(HashMap::new()),
            active: RwLock::new(active),
            nav_stack: Mutex::new(Vec::new()),
            agent_changed: Arc::new(Signal::new()),
            cancel: Arc::new(Signal::new()),
            output: Arc::new(Signal::new()),
            forwarders: Mutex::new(Vec::new()),
            persist,
            bus,
            logger,
        }
    }

    pub fn schema(&self) -> &Arc<SwarmSchema> {
        &self.schema
    }

    /// Restore persisted active agent and navigation stack, if any. A
    /// persisted agent no longer in the agent list is ignored.
    pub async fn restore(&self) -> Result<(), SwarmError> {
        if !self.schema.persist {
            return Ok(());
        }
        let Some(persist) = &self.persist else {
            return Ok(());
        };
        if let Some(agent_name) = persist
            .load_active_agent(&self.schema.swarm_name, &self.client_id)
            .await?
        {
            if self.schema.agent_list.contains(&agent_name) {
                *self.active.write().expect("active agent lock poisoned") = agent_name;
            }
        }
        let stack = persist
            .load_navigation_stack(&self.schema.swarm_name, &self.client_id)
            .await?;
        *self.nav_stack.lock().expect("navigation stack poisoned") = stack
            .into_iter()
            .filter(|name| self.schema.agent_list.contains(name))
            .collect();
        Ok(())
    }

    /// Register the concrete agent instance for `name`.
    ///
    /// The agent's output signal is forwarded into the swarm-level output
    /// channel from here on.
    pub fn set_agent_ref(&self, name: &str, agent: Arc<ClientAgent>) -> Result<(), SwarmError> {
        if !self.schema.agent_list.iter().any(|candidate| candidate == name) {
            return Err(SwarmError::AgentNotInSwarm {
                agent_name: name.to_string(),
                swarm_name: self.schema.swarm_name.clone(),
            });
        }
        let mut waiter = agent.output_waiter();
        let output = Arc::clone(&self.output);
        let forwarder = tokio::spawn(async move {
            loop {
                let value = waiter.recv().await;
                output.publish(value);
            }
        });
        self.forwarders
            .lock()
            .expect("forwarders lock poisoned")
            .push(forwarder);
        self.agents
            .write()
            .expect("agent map lock poisoned")
            .insert(name.to_string(), agent);
        Ok(())
    }

    pub fn get_agent_name(&self) -> AgentName {
        self.active.read().expect("active agent lock poisoned").clone()
    }

    /// The concrete instance of the active agent.
    pub fn get_agent(&self) -> Result<Arc<ClientAgent>, SwarmError> {
        let name = self.get_agent_name();
        self.agents
            .read()
            .expect("agent map lock poisoned")
            .get(&name)
            .cloned()
            .ok_or_else(|| SwarmError::AgentNotInSwarm {
                agent_name: name,
                swarm_name: self.schema.swarm_name.clone(),
            })
    }

    pub fn agent_ref(&self, name: &str) -> Option<Arc<ClientAgent>> {
        self.agents
            .read()
            .expect("agent map lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn navigation_stack(&self) -> Vec<AgentName> {
        self.nav_stack.lock().expect("navigation stack poisoned").clone()
    }

    async fn switch_active(&self, name: &str, push_prev: bool) -> Result<AgentName, SwarmError> {
        let prev = {
            let mut active = self.active.write().expect("active agent lock poisoned");
            let prev = active.clone();
            *active = name.to_string();
            prev
        };
        if push_prev && prev != name {
            self.nav_stack
                .lock()
                .expect("navigation stack poisoned")
                .push(prev.clone());
        }
        let stack_snapshot = self.navigation_stack();

        if self.schema.persist {
            if let Some(persist) = &self.persist {
                persist
                    .save_active_agent(&self.schema.swarm_name, &self.client_id, name)
                    .await?;
                persist
                    .save_navigation_stack(&self.schema.swarm_name, &self.client_id, &stack_snapshot)
                    .await?;
            }
        }

        if let Some(on_agent_changed) = &self.schema.callbacks.on_agent_changed {
            on_agent_changed(&self.client_id, &name.to_string(), &self.schema.swarm_name);
        }
        self.logger.info(
            &self.client_id,
            "agent changed",
            serde_json::json!({"from": prev, "to": name, "swarm": self.schema.swarm_name}),
        );
        self.bus
            .emit(
                &self.client_id,
                BusEvent::new(EventSource::SwarmBus, self.client_id.clone(), "agent-changed")
                    .with_input(serde_json::json!({"from": prev, "to": name}))
                    .with_context(EventContext {
                        agent_name: Some(name.to_string()),
                        swarm_name: Some(self.schema.swarm_name.clone()),
                        ..EventContext::default()
                    }),
            )
            .await;

        if prev != name {
            if let Some(outgoing) = self.agent_ref(&prev) {
                outgoing.commit_agent_change().await;
            }
        }
        self.agent_changed.publish(name.to_string());
        Ok(prev)
    }

    /// Atomic switch: push the prior agent onto the navigation stack and
    /// make `name` active.
    pub async fn set_agent_name(&self, name: &str) -> Result<(), SwarmError> {
        if !self.schema.agent_list.iter().any(|candidate| candidate == name) {
            return Err(SwarmError::AgentNotInSwarm {
                agent_name: name.to_string(),
                swarm_name: self.schema.swarm_name.clone(),
            });
        }
        self.switch_active(name, true).await?;
        Ok(())
    }

    /// Pop the navigation stack (default agent when empty) and make the
    /// popped agent active. Returns the new active agent name.
    pub async fn navigation_pop(&self) -> Result<AgentName, SwarmError> {
        let target = self
            .nav_stack
            .lock()
            .expect("navigation stack poisoned")
            .pop()
            .unwrap_or_else(|| self.schema.default_agent.clone());
        self.switch_active(&target, false).await?;
        Ok(target)
    }

    /// A future resolving with the next turn output, or the empty string
    /// if the wait is cancelled. Subscription happens at call time, before
    /// the future is first polled, so an output produced while the caller
    /// is still arranging the turn is not lost.
    pub fn wait_for_output(&self) -> impl std::future::Future<Output = String> + Send + 'static {
        let mut output = self.output.subscribe();
        let mut cancel = self.cancel.subscribe();
        let mut changed = self.agent_changed.subscribe();
        async move {
            loop {
                tokio::select! {
                    value = output.recv() => return value,
                    cancelled = cancel.recv() => return cancelled,
                    // a switch re-arms the wait; outputs keep flowing
                    // through the swarm-level channel either way
                    _ = changed.recv() => continue,
                }
            }
        }
    }

    /// Persistent waiter on the swarm-level output channel.
    pub fn output_waiter(&self) -> SignalWaiter<String> {
        self.output.subscribe()
    }

    /// Convert any pending output wait into an empty-string completion.
    pub fn cancel_output(&self) {
        self.cancel.publish(String::new());
    }

    pub async fn dispose(&self) {
        self.cancel.publish(String::new());
        for forwarder in self.forwarders.lock().expect("forwarders lock poisoned").drain(..) {
            forwarder.abort();
        }
        self.bus
            .emit(
                &self.client_id,
                BusEvent::new(EventSource::SwarmBus, self.client_id.clone(), "dispose")
                    .with_context(EventContext {
                        swarm_name: Some(self.schema.swarm_name.clone()),
                        ..EventContext::default()
                    }),
            )
            .await;
    }
}
