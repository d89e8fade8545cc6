//! Cross-reference validation and live-session bookkeeping.
//!
//! The registries only store schemas; this module answers the referential
//! questions the facade asks before delegating inward: is this swarm
//! registered, is its default agent in the list, does each agent's
//! completion/tool/storage/state exist, does this client have a live
//! session, did this agent declare that storage. Failures are fail-fast
//! [`SwarmError`]s that name the calling operation (`source`), so a broken
//! deployment is diagnosable from the first error message.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::swarm::error::SwarmError;
use crate::swarm::registry::SwarmRegistries;
use crate::swarm::types::{AgentName, ClientId, SessionMode, StateName, StorageName, SwarmName};

/// Schema cross-reference validation.
#[derive(Clone)]
pub struct ValidationServices {
    registries: Arc<SwarmRegistries>,
}

impl ValidationServices {
    pub fn new(registries: Arc<SwarmRegistries>) -> Self {
        Self { registries }
    }

    pub fn validate_completion(&self, name: &str, source: &str) -> Result<(), SwarmError> {
        if self.registries.completions.contains(name) {
            Ok(())
        } else {
            Err(SwarmError::SchemaNotFound {
                kind: "completion",
                name: name.to_string(),
                source: source.to_string(),
            })
        }
    }

    pub fn validate_tool(&self, name: &str, source: &str) -> Result<(), SwarmError> {
        if self.registries.tools.contains(name) {
            Ok(())
        } else {
            Err(SwarmError::SchemaNotFound {
                kind: "tool",
                name: name.to_string(),
                source: source.to_string(),
            })
        }
    }

    pub fn validate_embedding(&self, name: &str, source: &str) -> Result<(), SwarmError> {
        if self.registries.embeddings.contains(name) {
            Ok(())
        } else {
            Err(SwarmError::SchemaNotFound {
                kind: "embedding",
                name: name.to_string(),
                source: source.to_string(),
            })
        }
    }

    /// Storage must exist and its embedding backend must exist.
    pub fn validate_storage(&self, name: &str, source: &str) -> Result<(), SwarmError> {
        let schema = self.registries.storages.get(name).ok_or_else(|| SwarmError::SchemaNotFound {
            kind: "storage",
            name: name.to_string(),
            source: source.to_string(),
        })?;
        self.validate_embedding(&schema.embedding, source)
    }

    pub fn validate_state(&self, name: &str, source: &str) -> Result<(), SwarmError> {
        if self.registries.states.contains(name) {
            Ok(())
        } else {
            Err(SwarmError::SchemaNotFound {
                kind: "state",
                name: name.to_string(),
                source: source.to_string(),
            })
        }
    }

    /// Agent must exist, and so must everything it references: completion,
    /// tools, storages (with their embeddings), states, and the agents it
    /// declares as dependencies (presence only, cycles allowed).
    pub fn validate_agent(&self, name: &str, source: &str) -> Result<(), SwarmError> {
        let schema = self.registries.agents.get(name).ok_or_else(|| SwarmError::SchemaNotFound {
            kind: "agent",
            name: name.to_string(),
            source: source.to_string(),
        })?;
        self.validate_completion(&schema.completion, source)?;
        for tool in &schema.tools {
            self.validate_tool(tool, source)?;
        }
        for storage in &schema.storages {
            self.validate_storage(storage, source)?;
        }
        for state in &schema.states {
            self.validate_state(state, source)?;
        }
        for dependency in &schema.depends_on {
            if !self.registries.agents.contains(dependency) {
                return Err(SwarmError::SchemaNotFound {
                    kind: "agent",
                    name: dependency.clone(),
                    source: source.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Swarm must exist, its default agent must be in the agent list, and
    /// every listed agent must validate.
    pub fn validate_swarm(&self, name: &str, source: &str) -> Result<(), SwarmError> {
        let schema = self.registries.swarms.get(name).ok_or_else(|| SwarmError::SchemaNotFound {
            kind: "swarm",
            name: name.to_string(),
            source: source.to_string(),
        })?;
        if !schema.agent_list.contains(&schema.default_agent) {
            return Err(SwarmError::DefaultAgentNotInList {
                swarm_name: schema.swarm_name.clone(),
                default_agent: schema.default_agent.clone(),
            });
        }
        for agent in &schema.agent_list {
            self.validate_agent(agent, source)?;
        }
        Ok(())
    }

    /// `agent` must be part of `swarm`'s agent list.
    pub fn validate_agent_in_swarm(
        &self,
        agent: &str,
        swarm: &str,
        source: &str,
    ) -> Result<(), SwarmError> {
        let schema = self.registries.swarms.get(swarm).ok_or_else(|| SwarmError::SchemaNotFound {
            kind: "swarm",
            name: swarm.to_string(),
            source: source.to_string(),
        })?;
        if schema.agent_list.iter().any(|name| name == agent) {
            Ok(())
        } else {
            Err(SwarmError::AgentNotInSwarm {
                agent_name: agent.to_string(),
                swarm_name: swarm.to_string(),
            })
        }
    }
}

#[derive(Default)]
struct SessionTable {
    swarms: HashMap<ClientId, SwarmName>,
    modes: HashMap<ClientId, SessionMode>,
    agent_usage: HashMap<ClientId, HashMap<AgentName, usize>>,
    history_usage: HashMap<ClientId, HashMap<AgentName, usize>>,
    storage_usage: HashMap<ClientId, HashSet<StorageName>>,
    state_usage: HashMap<ClientId, HashSet<StateName>>,
}

/// Tracks live sessions and resource usage per client.
///
/// Usage counters are multisets for agents/histories (an agent may be
/// referenced more than once over a session's life) and sets for
/// storages/states.
#[derive(Clone)]
pub struct SessionValidation {
    table: Arc<Mutex<SessionTable>>,
}

impl SessionValidation {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(SessionTable::default())),
        }
    }

    /// Record a new session. A client holds at most one session; attaching
    /// the same client to a *different* swarm is an error, re-attaching to
    /// the same swarm is idempotent.
    pub fn add_session(
        &self,
        client_id: &str,
        swarm_name: &str,
        mode: SessionMode,
    ) -> Result<(), SwarmError> {
        let mut table = self.table.lock().expect("session table poisoned");
        if let Some(existing) = table.swarms.get(client_id) {
            if existing != swarm_name {
                return Err(SwarmError::SessionExists(client_id.to_string()));
            }
            return Ok(());
        }
        table.swarms.insert(client_id.to_string(), swarm_name.to_string());
        table.modes.insert(client_id.to_string(), mode);
        Ok(())
    }

    pub fn remove_session(&self, client_id: &str) {
        let mut table = self.table.lock().expect("session table poisoned");
        table.swarms.remove(client_id);
        table.modes.remove(client_id);
        table.agent_usage.remove(client_id);
        table.history_usage.remove(client_id);
        table.storage_usage.remove(client_id);
        table.state_usage.remove(client_id);
    }

    pub fn has_session(&self, client_id: &str) -> bool {
        self.table
            .lock()
            .expect("session table poisoned")
            .swarms
            .contains_key(client_id)
    }

    /// Fail unless `client_id` holds a live session.
    pub fn validate(&self, client_id: &str, _source: &str) -> Result<(), SwarmError> {
        if self.has_session(client_id) {
            Ok(())
        } else {
            Err(SwarmError::SessionNotFound(client_id.to_string()))
        }
    }

    pub fn swarm_of(&self, client_id: &str) -> Result<SwarmName, SwarmError> {
        self.table
            .lock()
            .expect("session table poisoned")
            .swarms
            .get(client_id)
            .cloned()
            .ok_or_else(|| SwarmError::SessionNotFound(client_id.to_string()))
    }

    pub fn mode_of(&self, client_id: &str) -> Result<SessionMode, SwarmError> {
        self.table
            .lock()
            .expect("session table poisoned")
            .modes
            .get(client_id)
            .copied()
            .ok_or_else(|| SwarmError::SessionNotFound(client_id.to_string()))
    }

    pub fn add_agent_usage(&self, client_id: &str, agent_name: &str) {
        let mut table = self.table.lock().expect("session table poisoned");
        *table
            .agent_usage
            .entry(client_id.to_string())
            .or_default()
            .entry(agent_name.to_string())
            .or_insert(0) += 1;
    }

    pub fn add_history_usage(&self, client_id: &str, agent_name: &str) {
        let mut table = self.table.lock().expect("session table poisoned");
        *table
            .history_usage
            .entry(client_id.to_string())
            .or_default()
            .entry(agent_name.to_string())
            .or_insert(0) += 1;
    }

    pub fn add_storage_usage(&self, client_id: &str, storage_name: &str) {
        let mut table = self.table.lock().expect("session table poisoned");
        table
            .storage_usage
            .entry(client_id.to_string())
            .or_default()
            .insert(storage_name.to_string());
    }

    pub fn add_state_usage(&self, client_id: &str, state_name: &str) {
        let mut table = self.table.lock().expect("session table poisoned");
        table
            .state_usage
            .entry(client_id.to_string())
            .or_default()
            .insert(state_name.to_string());
    }

    pub fn agent_usage(&self, client_id: &str, agent_name: &str) -> usize {
        self.table
            .lock()
            .expect("session table poisoned")
            .agent_usage
            .get(client_id)
            .and_then(|usage| usage.get(agent_name))
            .copied()
            .unwrap_or(0)
    }
}

impl Default for SessionValidation {
    fn default() -> Self {
        Self::new()
    }
}
