//! Filesystem persistence.
//!
//! Persistence is a self-healing cache, not a database: every entity is one
//! JSON file written atomically (write temp, then rename), and directory
//! initialization deletes any file that no longer parses instead of
//! failing. Adapter traits keep the swarm controller, state and storage
//! layers independent of the on-disk layout — the `Fs*` implementations
//! below provide the default layout:
//!
//! ```text
//! <base>/_swarm_active_agent/<swarmName>/<clientId>.json      {"agentName": ...}
//! <base>/_swarm_navigation_stack/<swarmName>/<clientId>.json  {"agentStack": [...]}
//! <base>/state/<stateName>/<clientId>.json                    {"state": ...}
//! <base>/storage/<storageName>/<clientId>.json                {"data": [...]}
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::swarm::error::SwarmError;
use crate::swarm::schema::{StateValue, StorageItem};
use crate::swarm::types::AgentName;

const CORRUPT_REMOVE_ATTEMPTS: usize = 3;

/// One directory of JSON entities, one file per key.
pub struct PersistBase {
    dir: PathBuf,
}

impl PersistBase {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entity_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Create the directory and heal it: any file that does not parse as
    /// JSON is removed (bounded retries), logged and skipped.
    pub async fn wait_for_init(&self) -> Result<(), SwarmError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SwarmError::PersistenceFailed(format!("create {:?}: {}", self.dir, e)))?;

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| SwarmError::PersistenceFailed(format!("scan {:?}: {}", self.dir, e)))?;

        while let Ok(Some(entry)) = entries.next_entry().await.map_err(|_| ()) {
            let path = entry.path();
            if path.extension().map(|ext| ext != "json").unwrap_or(true) {
                continue;
            }
            let readable = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<serde_json::Value>(&bytes).is_ok(),
                Err(_) => false,
            };
            if !readable {
                log::warn!("removing corrupt persistence entity {:?}", path);
                for attempt in 0..CORRUPT_REMOVE_ATTEMPTS {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => break,
                        Err(e) if attempt + 1 == CORRUPT_REMOVE_ATTEMPTS => {
                            log::warn!("could not remove corrupt entity {:?}: {}", path, e);
                        }
                        Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                    }
                }
            }
        }
        Ok(())
    }

    /// Read the entity stored under `key`. A corrupt file is removed and
    /// treated as absent.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SwarmError> {
        let path = self.entity_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SwarmError::PersistenceFailed(format!("read {:?}: {}", path, e)))
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                log::warn!("removing corrupt persistence entity {:?}: {}", path, e);
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    /// Atomically write the entity stored under `key`.
    pub async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SwarmError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SwarmError::PersistenceFailed(format!("create {:?}: {}", self.dir, e)))?;
        let path = self.entity_path(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| SwarmError::PersistenceFailed(format!("serialize {}: {}", key, e)))?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SwarmError::PersistenceFailed(format!("write {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SwarmError::PersistenceFailed(format!("rename {:?}: {}", path, e)))?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), SwarmError> {
        let path = self.entity_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SwarmError::PersistenceFailed(format!("remove {:?}: {}", path, e))),
        }
    }

    /// All keys currently present, unordered.
    pub async fn keys(&self) -> Result<Vec<String>, SwarmError> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => {
                return Err(SwarmError::PersistenceFailed(format!("scan {:?}: {}", self.dir, e)))
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await.map_err(|_| ()) {
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        Ok(keys)
    }
}

/// Ordered store on top of [`PersistBase`]: items are keyed by
/// monotonically increasing zero-padded numeric strings, giving push/pop
/// semantics that survive restarts.
pub struct PersistList {
    base: PersistBase,
    last_key: Mutex<Option<u64>>,
}

impl PersistList {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            base: PersistBase::new(dir),
            last_key: Mutex::new(None),
        }
    }

    pub async fn wait_for_init(&self) -> Result<(), SwarmError> {
        self.base.wait_for_init().await
    }

    async fn numeric_keys(&self) -> Result<Vec<u64>, SwarmError> {
        let mut keys: Vec<u64> = self
            .base
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| key.parse().ok())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    /// Append `value` after the highest existing key.
    pub async fn push<T: Serialize>(&self, value: &T) -> Result<(), SwarmError> {
        let mut last = self.last_key.lock().await;
        let next = match *last {
            Some(key) => key + 1,
            None => self
                .numeric_keys()
                .await?
                .last()
                .map(|key| key + 1)
                .unwrap_or(0),
        };
        self.base.write(&format!("{:020}", next), value).await?;
        *last = Some(next);
        Ok(())
    }

    /// Remove and return the most recently pushed value.
    pub async fn pop<T: DeserializeOwned>(&self) -> Result<Option<T>, SwarmError> {
        let mut last = self.last_key.lock().await;
        let keys = self.numeric_keys().await?;
        let Some(top) = keys.last().copied() else {
            *last = None;
            return Ok(None);
        };
        let key = format!("{:020}", top);
        let value = self.base.read(&key).await?;
        self.base.remove(&key).await?;
        *last = keys.len().checked_sub(2).map(|i| keys[i]);
        Ok(value)
    }

    pub async fn len(&self) -> Result<usize, SwarmError> {
        Ok(self.numeric_keys().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, SwarmError> {
        Ok(self.numeric_keys().await?.is_empty())
    }
}

// ── Adapter seams ─────────────────────────────────────────────────────────

/// Persists the swarm controller's active agent and navigation stack.
#[async_trait]
pub trait SwarmPersistAdapter: Send + Sync {
    async fn load_active_agent(
        &self,
        swarm_name: &str,
        client_id: &str,
    ) -> Result<Option<AgentName>, SwarmError>;

    async fn save_active_agent(
        &self,
        swarm_name: &str,
        client_id: &str,
        agent_name: &str,
    ) -> Result<(), SwarmError>;

    async fn load_navigation_stack(
        &self,
        swarm_name: &str,
        client_id: &str,
    ) -> Result<Vec<AgentName>, SwarmError>;

    async fn save_navigation_stack(
        &self,
        swarm_name: &str,
        client_id: &str,
        stack: &[AgentName],
    ) -> Result<(), SwarmError>;
}

/// Persists state cells.
#[async_trait]
pub trait StatePersistAdapter: Send + Sync {
    async fn load_state(
        &self,
        state_name: &str,
        client_id: &str,
    ) -> Result<Option<StateValue>, SwarmError>;

    async fn save_state(
        &self,
        state_name: &str,
        client_id: &str,
        state: &StateValue,
    ) -> Result<(), SwarmError>;
}

/// Persists storage data sets.
#[async_trait]
pub trait StoragePersistAdapter: Send + Sync {
    async fn load_data(
        &self,
        storage_name: &str,
        client_id: &str,
    ) -> Result<Option<Vec<StorageItem>>, SwarmError>;

    async fn save_data(
        &self,
        storage_name: &str,
        client_id: &str,
        data: &[StorageItem],
    ) -> Result<(), SwarmError>;
}

// ── Default filesystem adapters ───────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ActiveAgentRecord {
    #[serde(rename = "agentName")]
    agent_name: AgentName,
}

#[derive(Serialize, Deserialize)]
struct NavigationStackRecord {
    #[serde(rename = "agentStack")]
    agent_stack: Vec<AgentName>,
}

#[derive(Serialize, Deserialize)]
struct StateRecord {
    state: StateValue,
}

#[derive(Serialize, Deserialize)]
struct StorageRecord {
    data: Vec<StorageItem>,
}

/// Tracks which entity directories have been healed already, so the init
/// scan runs once per directory per process.
struct InitTracker {
    seen: Mutex<HashSet<PathBuf>>,
}

impl InitTracker {
    fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }

    async fn base_for(&self, dir: PathBuf) -> Result<PersistBase, SwarmError> {
        let base = PersistBase::new(dir.clone());
        let mut seen = self.seen.lock().await;
        if seen.insert(dir) {
            base.wait_for_init().await?;
        }
        Ok(base)
    }
}

/// Default filesystem layout for the swarm controller.
pub struct FsSwarmPersist {
    base_dir: PathBuf,
    init: InitTracker,
}

impl FsSwarmPersist {
    pub fn new(base_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            base_dir: base_dir.into(),
            init: InitTracker::new(),
        })
    }

    async fn active_base(&self, swarm_name: &str) -> Result<PersistBase, SwarmError> {
        self.init
            .base_for(self.base_dir.join("_swarm_active_agent").join(swarm_name))
            .await
    }

    async fn stack_base(&self, swarm_name: &str) -> Result<PersistBase, SwarmError> {
        self.init
            .base_for(self.base_dir.join("_swarm_navigation_stack").join(swarm_name))
            .await
    }
}

#[async_trait]
impl SwarmPersistAdapter for FsSwarmPersist {
    async fn load_active_agent(
        &self,
        swarm_name: &str,
        client_id: &str,
    ) -> Result<Option<AgentName>, SwarmError> {
        let base = self.active_base(swarm_name).await?;
        Ok(base
            .read::<ActiveAgentRecord>(client_id)
            .await?
            .map(|record| record.agent_name))
    }

    async fn save_active_agent(
        &self,
        swarm_name: &str,
        client_id: &str,
        agent_name: &str,
    ) -> Result<(), SwarmError> {
        let base = self.active_base(swarm_name).await?;
        base.write(
            client_id,
            &ActiveAgentRecord {
                agent_name: agent_name.to_string(),
            },
        )
        .await
    }

    async fn load_navigation_stack(
        &self,
        swarm_name: &str,
        client_id: &str,
    ) -> Result<Vec<AgentName>, SwarmError> {
        let base = self.stack_base(swarm_name).await?;
        Ok(base
            .read::<NavigationStackRecord>(client_id)
            .await?
            .map(|record| record.agent_stack)
            .unwrap_or_default())
    }

    async fn save_navigation_stack(
        &self,
        swarm_name: &str,
        client_id: &str,
        stack: &[AgentName],
    ) -> Result<(), SwarmError> {
        let base = self.stack_base(swarm_name).await?;
        base.write(
            client_id,
            &NavigationStackRecord {
                agent_stack: stack.to_vec(),
            },
        )
        .await
    }
}

/// Default filesystem layout for state cells.
pub struct FsStatePersist {
    base_dir: PathBuf,
    init: InitTracker,
}

impl FsStatePersist {
    pub fn new(base_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            base_dir: base_dir.into(),
            init: InitTracker::new(),
        })
    }
}

#[async_trait]
impl StatePersistAdapter for FsStatePersist {
    async fn load_state(
        &self,
        state_name: &str,
        client_id: &str,
    ) -> Result<Option<StateValue>, SwarmError> {
        let base = self
            .init
            .base_for(self.base_dir.join("state").join(state_name))
            .await?;
        Ok(base
            .read::<StateRecord>(client_id)
            .await?
            .map(|record| record.state))
    }

    async fn save_state(
        &self,
        state_name: &str,
        client_id: &str,
        state: &StateValue,
    ) -> Result<(), SwarmError> {
        let base = self
            .init
            .base_for(self.base_dir.join("state").join(state_name))
            .await?;
        base.write(client_id, &StateRecord { state: state.clone() }).await
    }
}

/// Default filesystem layout for storage data.
pub struct FsStoragePersist {
    base_dir: PathBuf,
    init: InitTracker,
}

impl FsStoragePersist {
    pub fn new(base_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            base_dir: base_dir.into(),
            init: InitTracker::new(),
        })
    }
}

#[async_trait]
impl StoragePersistAdapter for FsStoragePersist {
    async fn load_data(
        &self,
        storage_name: &str,
        client_id: &str,
    ) -> Result<Option<Vec<StorageItem>>, SwarmError> {
        let base = self
            .init
            .base_for(self.base_dir.join("storage").join(storage_name))
            .await?;
        Ok(base
            .read::<StorageRecord>(client_id)
            .await?
            .map(|record| record.data))
    }

    async fn save_data(
        &self,
        storage_name: &str,
        client_id: &str,
        data: &[StorageItem],
    ) -> Result<(), SwarmError> {
        let base = self
            .init
            .base_for(self.base_dir.join("storage").join(storage_name))
            .await?;
        base.write(
            client_id,
            &StorageRecord {
                data: data.to_vec(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_round_trip_and_healing() {
        let dir = tempfile::tempdir().unwrap();
        let base = PersistBase::new(dir.path());
        base.wait_for_init().await.unwrap();

        base.write("c1", &serde_json::json!({"agentName": "triage"}))
            .await
            .unwrap();
        let value: Option<serde_json::Value> = base.read("c1").await.unwrap();
        assert_eq!(value.unwrap()["agentName"], "triage");

        // plant a corrupt entity and re-run init
        tokio::fs::write(dir.path().join("broken.json"), b"{ not json")
            .await
            .unwrap();
        base.wait_for_init().await.unwrap();
        assert!(!dir.path().join("broken.json").exists());
        assert!(dir.path().join("c1.json").exists());
    }

    #[tokio::test]
    async fn persist_list_push_pop_is_lifo() {
        let dir = tempfile::tempdir().unwrap();
        let list = PersistList::new(dir.path());
        list.wait_for_init().await.unwrap();

        list.push(&serde_json::json!("first")).await.unwrap();
        list.push(&serde_json::json!("second")).await.unwrap();
        assert_eq!(list.len().await.unwrap(), 2);

        let top: Option<serde_json::Value> = list.pop().await.unwrap();
        assert_eq!(top.unwrap(), "second");
        let next: Option<serde_json::Value> = list.pop().await.unwrap();
        assert_eq!(next.unwrap(), "first");
        let empty: Option<serde_json::Value> = list.pop().await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn fs_swarm_persist_uses_expected_layout() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FsSwarmPersist::new(dir.path());

        adapter
            .save_active_agent("support", "c1", "sales")
            .await
            .unwrap();
        adapter
            .save_navigation_stack("support", "c1", &["triage".to_string()])
            .await
            .unwrap();

        assert!(dir
            .path()
            .join("_swarm_active_agent/support/c1.json")
            .exists());
        assert!(dir
            .path()
            .join("_swarm_navigation_stack/support/c1.json")
            .exists());

        assert_eq!(
            adapter.load_active_agent("support", "c1").await.unwrap(),
            Some("sales".to_string())
        );
        assert_eq!(
            adapter.load_navigation_stack("support", "c1").await.unwrap(),
            vec!["triage".to_string()]
        );
    }
}
