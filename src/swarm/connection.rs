//! Memoized connection services.
//!
//! Every runtime instance — agent, history, swarm, session, storage,
//! state — is built once per composite key (`"{client_id}-{name}"`) and
//! handed out by reference from then on: two callers asking for the same
//! key receive the same `Arc`. Disposal evicts the memo entries, so a
//! later lookup builds a fresh instance.
//!
//! The getters live here as an `impl` block on [`SwarmCore`] because
//! construction wires together registries, validation bookkeeping, the
//! bus, the logger and the config — all owned by the core.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::swarm::client_agent::ClientAgent;
use crate::swarm::client_session::ClientSession;
use crate::swarm::client_swarm::ClientSwarm;
use crate::swarm::error::SwarmError;
use crate::swarm::facade::{SwarmCore, WeakSwarmHandle};
use crate::swarm::history::ClientHistory;
use crate::swarm::persist::{FsStatePersist, FsStoragePersist, FsSwarmPersist};
use crate::swarm::state::ClientState;
use crate::swarm::storage::{ClientStorage, SHARED_CLIENT_ID};

/// One build-once cache keyed by composite string keys.
pub struct Memo<T: Clone> {
    map: Mutex<HashMap<String, T>>,
}

impl<T: Clone> Memo<T> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.map.lock().expect("memo lock poisoned").get(key).cloned()
    }

    /// Store `value` unless the key was filled meanwhile; returns the
    /// value that ended up cached.
    pub fn insert_if_absent(&self, key: &str, value: T) -> T {
        self.map
            .lock()
            .expect("memo lock poisoned")
            .entry(key.to_string())
            .or_insert(value)
            .clone()
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.map.lock().expect("memo lock poisoned").remove(key)
    }

    pub fn remove_by_prefix(&self, prefix: &str) -> Vec<T> {
        let mut map = self.map.lock().expect("memo lock poisoned");
        let keys: Vec<String> = map
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.into_iter().filter_map(|key| map.remove(&key)).collect()
    }
}

impl<T: Clone> Default for Memo<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The memo caches of one runtime instance.
pub struct ConnectionServices {
    pub(crate) agents: Memo<Arc<ClientAgent>>,
    pub(crate) histories: Memo<Arc<ClientHistory>>,
    pub(crate) swarms: Memo<Arc<ClientSwarm>>,
    pub(crate) sessions: Memo<Arc<ClientSession>>,
    pub(crate) storages: Memo<Arc<ClientStorage>>,
    pub(crate) states: Memo<Arc<ClientState>>,
}

impl ConnectionServices {
    pub fn new() -> Self {
        Self {
            agents: Memo::new(),
            histories: Memo::new(),
            swarms: Memo::new(),
            sessions: Memo::new(),
            storages: Memo::new(),
            states: Memo::new(),
        }
    }
}

impl Default for ConnectionServices {
    fn default() -> Self {
        Self::new()
    }
}

fn composite_key(client_id: &str, name: &str) -> String {
    format!("{}-{}", client_id, name)
}

impl SwarmCore {
    pub(crate) fn history_connection(&self, client_id: &str, agent_name: &str) -> Arc<ClientHistory> {
        let key = composite_key(client_id, agent_name);
        if let Some(history) = self.connections.histories.get(&key) {
            return history;
        }
        let history = Arc::new(ClientHistory::new(
            client_id,
            agent_name,
            self.bus.clone(),
            self.logger.clone(),
        ));
        self.session_validation.add_history_usage(client_id, agent_name);
        self.connections.histories.insert_if_absent(&key, history)
    }

    pub(crate) fn agent_connection(
        self: &Arc<Self>,
        client_id: &str,
        agent_name: &str,
    ) -> Result<Arc<ClientAgent>, SwarmError> {
        let key = composite_key(client_id, agent_name);
        if let Some(agent) = self.connections.agents.get(&key) {
            return Ok(agent);
        }

        let source = "AgentConnection.get_agent";
        let schema = self.registries.agents.get(agent_name).ok_or_else(|| {
            SwarmError::SchemaNotFound {
                kind: "agent",
                name: agent_name.to_string(),
                source: source.to_string(),
            }
        })?;
        let completion = self
            .registries
            .completions
            .get(&schema.completion)
            .ok_or_else(|| SwarmError::SchemaNotFound {
                kind: "completion",
                name: schema.completion.clone(),
                source: source.to_string(),
            })?;
        let tools = schema
            .tools
            .iter()
            .map(|tool_name| {
                self.registries.tools.get(tool_name).ok_or_else(|| SwarmError::SchemaNotFound {
                    kind: "tool",
                    name: tool_name.clone(),
                    source: source.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let history = self.history_connection(client_id, agent_name);
        let swarm_name = self.session_validation.swarm_of(client_id).unwrap_or_default();

        let agent = Arc::new(ClientAgent::new(
            client_id,
            swarm_name,
            schema,
            completion,
            tools,
            history,
            self.bus.clone(),
            self.logger.clone(),
            Arc::clone(&self.config),
            WeakSwarmHandle::new(Arc::downgrade(self)),
        ));
        self.session_validation.add_agent_usage(client_id, agent_name);
        Ok(self.connections.agents.insert_if_absent(&key, agent))
    }

    pub(crate) async fn swarm_connection(
        self: &Arc<Self>,
        client_id: &str,
        swarm_name: &str,
    ) -> Result<Arc<ClientSwarm>, SwarmError> {
        let key = composite_key(client_id, swarm_name);
        if let Some(swarm) = self.connections.swarms.get(&key) {
            return Ok(swarm);
        }

        let schema = self.registries.swarms.get(swarm_name).ok_or_else(|| {
            SwarmError::SchemaNotFound {
                kind: "swarm",
                name: swarm_name.to_string(),
                source: "SwarmConnection.get_swarm".to_string(),
            }
        })?;
        let persist = {
            let config = self.config.read().expect("config lock poisoned");
            match &config.swarm_persist {
                Some(adapter) => Some(Arc::clone(adapter)),
                None if schema.persist => {
                    let adapter: Arc<dyn crate::swarm::persist::SwarmPersistAdapter> =
                        FsSwarmPersist::new(config.persist_base_dir.clone());
                    Some(adapter)
                }
                None => None,
            }
        };

        let swarm = Arc::new(ClientSwarm::new(
            client_id,
            Arc::clone(&schema),
            persist,
            self.bus.clone(),
            self.logger.clone(),
        ));
        swarm.restore().await?;
        for agent_name in &schema.agent_list {
            let agent = self.agent_connection(client_id, agent_name)?;
            swarm.set_agent_ref(agent_name, agent)?;
        }

        let stored = self.connections.swarms.insert_if_absent(&key, Arc::clone(&swarm));
        if !Arc::ptr_eq(&stored, &swarm) {
            // lost the build race; tear down our duplicate's forwarders
            swarm.dispose().await;
        }
        Ok(stored)
    }

    pub(crate) async fn session_connection(
        self: &Arc<Self>,
        client_id: &str,
        swarm_name: &str,
    ) -> Result<Arc<ClientSession>, SwarmError> {
        let key = composite_key(client_id, swarm_name);
        if let Some(session) = self.connections.sessions.get(&key) {
            return Ok(session);
        }
        let swarm = self.swarm_connection(client_id, swarm_name).await?;
        let session = Arc::new(ClientSession::new(
            client_id,
            swarm_name,
            swarm,
            self.bus.clone(),
            self.logger.clone(),
        ));
        Ok(self.connections.sessions.insert_if_absent(&key, session))
    }

    pub(crate) async fn storage_connection(
        self: &Arc<Self>,
        client_id: &str,
        storage_name: &str,
    ) -> Result<Arc<ClientStorage>, SwarmError> {
        let schema = self.registries.storages.get(storage_name).ok_or_else(|| {
            SwarmError::SchemaNotFound {
                kind: "storage",
                name: storage_name.to_string(),
                source: "StorageConnection.get_storage".to_string(),
            }
        })?;
        let owner = if schema.shared { SHARED_CLIENT_ID } else { client_id };
        let key = composite_key(owner, storage_name);
        if let Some(storage) = self.connections.storages.get(&key) {
            self.session_validation.add_storage_usage(client_id, storage_name);
            return Ok(storage);
        }

        let embedding = self.registries.embeddings.get(&schema.embedding).ok_or_else(|| {
            SwarmError::SchemaNotFound {
                kind: "embedding",
                name: schema.embedding.clone(),
                source: "StorageConnection.get_storage".to_string(),
            }
        })?;
        let persist = {
            let config = self.config.read().expect("config lock poisoned");
            match &config.storage_persist {
                Some(adapter) => Some(Arc::clone(adapter)),
                None if schema.persist => {
                    let adapter: Arc<dyn crate::swarm::persist::StoragePersistAdapter> =
                        FsStoragePersist::new(config.persist_base_dir.clone());
                    Some(adapter)
                }
                None => None,
            }
        };

        let storage = Arc::new(ClientStorage::new(
            owner,
            schema,
            embedding,
            persist,
            self.bus.clone(),
            self.logger.clone(),
            Arc::clone(&self.config),
        ));
        storage.wait_for_init().await?;
        self.session_validation.add_storage_usage(client_id, storage_name);
        Ok(self.connections.storages.insert_if_absent(&key, storage))
    }

    pub(crate) async fn state_connection(
        self: &Arc<Self>,
        client_id: &str,
        state_name: &str,
    ) -> Result<Arc<ClientState>, SwarmError> {
        let schema = self.registries.states.get(state_name).ok_or_else(|| {
            SwarmError::SchemaNotFound {
                kind: "state",
                name: state_name.to_string(),
                source: "StateConnection.get_state".to_string(),
            }
        })?;
        let owner = if schema.shared { SHARED_CLIENT_ID } else { client_id };
        let key = composite_key(owner, state_name);
        if let Some(state) = self.connections.states.get(&key) {
            self.session_validation.add_state_usage(client_id, state_name);
            return Ok(state);
        }

        let persist = {
            let config = self.config.read().expect("config lock poisoned");
            match &config.state_persist {
                Some(adapter) => Some(Arc::clone(adapter)),
                None if schema.persist => {
                    let adapter: Arc<dyn crate::swarm::persist::StatePersistAdapter> =
                        FsStatePersist::new(config.persist_base_dir.clone());
                    Some(adapter)
                }
                None => None,
            }
        };

        let state = Arc::new(ClientState::new(
            owner,
            schema,
            persist,
            self.bus.clone(),
            self.logger.clone(),
        ));
        state.wait_for_init().await?;
        self.session_validation.add_state_usage(client_id, state_name);
        Ok(self.connections.states.insert_if_absent(&key, state))
    }

    /// Tear down everything memoized for `(client_id, swarm_name)` and
    /// forget the session. Shared storage/state instances survive — they
    /// belong to the swarm, not to any single client.
    pub(crate) async fn dispose_connection(
        &self,
        client_id: &str,
        swarm_name: &str,
    ) -> Result<(), SwarmError> {
        let key = composite_key(client_id, swarm_name);
        if let Some(session) = self.connections.sessions.remove(&key) {
            session.dispose().await;
        }
        if let Some(swarm) = self.connections.swarms.remove(&key) {
            swarm.dispose().await;
        }
        if let Some(schema) = self.registries.swarms.get(swarm_name) {
            for agent_name in &schema.agent_list {
                let agent_key = composite_key(client_id, agent_name);
                if let Some(agent) = self.connections.agents.remove(&agent_key) {
                    agent.dispose().await;
                }
                self.connections.histories.remove(&agent_key);
            }
        }
        let client_prefix = format!("{}-", client_id);
        for storage in self.connections.storages.remove_by_prefix(&client_prefix) {
            storage.dispose().await;
        }
        for state in self.connections.states.remove_by_prefix(&client_prefix) {
            state.dispose().await;
        }
        self.session_validation.remove_session(client_id);
        self.bus.dispose(client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_returns_same_value_until_removed() {
        let memo: Memo<Arc<String>> = Memo::new();
        let first = memo.insert_if_absent("c1-agent", Arc::new("a".to_string()));
        let second = memo.insert_if_absent("c1-agent", Arc::new("b".to_string()));
        assert!(Arc::ptr_eq(&first, &second));

        memo.remove("c1-agent");
        let third = memo.insert_if_absent("c1-agent", Arc::new("c".to_string()));
        assert_eq!(*third, "c");
    }

    #[test]
    fn memo_prefix_removal_targets_one_client() {
        let memo: Memo<Arc<String>> = Memo::new();
        memo.insert_if_absent("c1-docs", Arc::new("x".to_string()));
        memo.insert_if_absent("c2-docs", Arc::new("y".to_string()));

        let removed = memo.remove_by_prefix("c1-");
        assert_eq!(removed.len(), 1);
        assert!(memo.get("c2-docs").is_some());
    }
}
