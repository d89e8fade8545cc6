//! Per-client searchable storage.
//!
//! A [`ClientStorage`] holds an ordered set of JSON items, each indexed by
//! the text produced by its schema's `create_index` function. `take`
//! performs embedding similarity search through the storage's registered
//! [`EmbeddingProvider`](crate::swarm::schema::EmbeddingProvider): the
//! top-`pool` candidates are filtered by the configured similarity floor
//! and at most `total` survivors are returned. Item embeddings are cached
//! per item id and invalidated on upsert.
//!
//! Instances are either per-client or, for schemas declared `shared`,
//! swarm-wide under the reserved client id `"shared"`. All mutations go
//! through the instance's lock, serializing access per storage.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::swarm::bus::{BusEvent, EventBus, EventContext, EventSource};
use crate::swarm::config::SharedConfig;
use crate::swarm::error::SwarmError;
use crate::swarm::logger::SwarmLogger;
use crate::swarm::persist::StoragePersistAdapter;
use crate::swarm::schema::{EmbeddingSchema, ItemId, StorageItem, StorageSchema};
use crate::swarm::types::{ClientId, StorageName};

/// Reserved client id owning shared storage/state instances.
pub const SHARED_CLIENT_ID: &str = "shared";

pub struct ClientStorage {
    storage_name: StorageName,
    client_id: ClientId,
    schema: Arc<StorageSchema>,
    embedding: Arc<EmbeddingSchema>,
    items: Mutex<Vec<StorageItem>>,
    index_embeddings: Mutex<HashMap<String, Vec<f32>>>,
    persist: Option<Arc<dyn StoragePersistAdapter>>,
    bus: EventBus,
    logger: SwarmLogger,
    config: SharedConfig,
}

impl ClientStorage {
    pub fn new(
        client_id: impl Into<ClientId>,
        schema: Arc<StorageSchema>,
        embedding: Arc<EmbeddingSchema>,
        persist: Option<Arc<dyn StoragePersistAdapter>>,
        bus: EventBus,
        logger: SwarmLogger,
        config: SharedConfig,
    ) -> Self {
        Self {
            storage_name: schema.storage_name.clone(),
            client_id: client_id.into(),
            schema,
            embedding,
            items: Mutex::new(Vec::new()),
            index_embeddings: Mutex::new(HashMap::new()),
            persist,
            bus,
            logger,
            config,
        }
    }

    /// Load persisted data (or the schema's default data) into the
    /// instance. Called once by the connection layer after construction.
    pub async fn wait_for_init(&self) -> Result<(), SwarmError> {
        let mut initial = None;
        if self.schema.persist {
            if let Some(persist) = &self.persist {
                initial = persist.load_data(&self.storage_name, &self.client_id).await?;
            }
        }
        if initial.is_none() {
            if let Some(default_data) = &self.schema.get_default_data {
                initial = Some(default_data(&self.client_id, &self.storage_name));
            }
        }
        if let Some(data) = initial {
            *self.items.lock().await = data;
        }
        if let Some(on_init) = &self.schema.callbacks.on_init {
            on_init(&self.client_id, &self.storage_name);
        }
        self.emit_event("init", serde_json::Value::Null).await;
        Ok(())
    }

    async fn emit_event(&self, kind: &str, input: serde_json::Value) {
        self.bus
            .emit(
                &self.client_id,
                BusEvent::new(EventSource::StorageBus, self.client_id.clone(), kind)
                    .with_input(input)
                    .with_context(EventContext {
                        storage_name: Some(self.storage_name.clone()),
                        ..EventContext::default()
                    }),
            )
            .await;
    }

    async fn flush_to_persist(&self, items: &[StorageItem]) -> Result<(), SwarmError> {
        if self.schema.persist {
            if let Some(persist) = &self.persist {
                persist
                    .save_data(&self.storage_name, &self.client_id, items)
                    .await?;
            }
        }
        Ok(())
    }

    async fn embedding_for(&self, item: &StorageItem) -> Result<Vec<f32>, SwarmError> {
        let key = item.id.to_string();
        if let Some(cached) = self.index_embeddings.lock().await.get(&key) {
            return Ok(cached.clone());
        }
        let index_text = (self.schema.create_index)(item);
        let vector = self
            .embedding
            .provider
            .create_embedding(&index_text)
            .await
            .map_err(|e| SwarmError::ExecutionFailed(format!("create embedding: {}", e)))?;
        self.index_embeddings.lock().await.insert(key, vector.clone());
        Ok(vector)
    }

    /// Similarity search: score every item against `search`, consider the
    /// top-`pool` candidates, drop those under the similarity floor and
    /// return at most `total`.
    pub async fn take(&self, search: &str, total: usize) -> Result<Vec<StorageItem>, SwarmError> {
        if let Some(on_search) = &self.schema.callbacks.on_search {
            on_search(&self.client_id, &self.storage_name, search);
        }
        let (similarity_floor, pool) = {
            let config = self.config.read().expect("config lock poisoned");
            (config.storage_search_similarity, config.storage_search_pool)
        };

        let items = self.items.lock().await.clone();
        let search_vector = self
            .embedding
            .provider
            .create_embedding(search)
            .await
            .map_err(|e| SwarmError::ExecutionFailed(format!("create embedding: {}", e)))?;

        let mut scored = Vec::with_capacity(items.len());
        for item in items {
            let vector = self.embedding_for(&item).await?;
            let score = self
                .embedding
                .provider
                .calculate_similarity(&search_vector, &vector)
                .await
                .map_err(|e| SwarmError::ExecutionFailed(format!("similarity: {}", e)))?;
            scored.push((score, item));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(pool.max(total));

        let result: Vec<StorageItem> = scored
            .into_iter()
            .filter(|(score, _)| *score >= similarity_floor)
            .take(total)
            .map(|(_, item)| item)
            .collect();

        self.logger.debug(
            &self.client_id,
            "storage take",
            serde_json::json!({"storage": self.storage_name, "search": search, "hits": result.len()}),
        );
        self.emit_event("take", serde_json::json!({"search": search, "total": total}))
            .await;
        Ok(result)
    }

    /// Insert or replace the item with the same id.
    pub async fn upsert(&self, item: StorageItem) -> Result<(), SwarmError> {
        let snapshot = {
            let mut items = self.items.lock().await;
            match items.iter_mut().find(|existing| existing.id == item.id) {
                Some(existing) => *existing = item.clone(),
                None => items.push(item.clone()),
            }
            items.clone()
        };
        self.index_embeddings.lock().await.remove(&item.id.to_string());
        self.flush_to_persist(&snapshot).await?;
        if let Some(on_update) = &self.schema.callbacks.on_update {
            on_update(&self.client_id, &self.storage_name, &snapshot);
        }
        self.emit_event("upsert", serde_json::to_value(&item).unwrap_or_default())
            .await;
        Ok(())
    }

    pub async fn remove(&self, id: &ItemId) -> Result<(), SwarmError> {
        let snapshot = {
            let mut items = self.items.lock().await;
            items.retain(|item| &item.id != id);
            items.clone()
        };
        self.index_embeddings.lock().await.remove(&id.to_string());
        self.flush_to_persist(&snapshot).await?;
        if let Some(on_update) = &self.schema.callbacks.on_update {
            on_update(&self.client_id, &self.storage_name, &snapshot);
        }
        self.emit_event("remove", serde_json::json!({"id": id.to_string()}))
            .await;
        Ok(())
    }

    pub async fn get(&self, id: &ItemId) -> Option<StorageItem> {
        self.items
            .lock()
            .await
            .iter()
            .find(|item| &item.id == id)
            .cloned()
    }

    /// Every item, in insertion order.
    pub async fn list(&self) -> Vec<StorageItem> {
        self.items.lock().await.clone()
    }

    pub async fn clear(&self) -> Result<(), SwarmError> {
        {
            let mut items = self.items.lock().await;
            items.clear();
        }
        self.index_embeddings.lock().await.clear();
        self.flush_to_persist(&[]).await?;
        if let Some(on_update) = &self.schema.callbacks.on_update {
            on_update(&self.client_id, &self.storage_name, &[]);
        }
        self.emit_event("clear", serde_json::Value::Null).await;
        Ok(())
    }

    pub async fn dispose(&self) {
        if let Some(on_dispose) = &self.schema.callbacks.on_dispose {
            on_dispose(&self.client_id, &self.storage_name);
        }
        self.emit_event("dispose", serde_json::Value::Null).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::config::SwarmConfig;
    use crate::swarm::schema::EmbeddingProvider;
    use async_trait::async_trait;
    use std::sync::RwLock;

    /// Embeds a string as its lowercase character histogram and compares
    /// with cosine similarity — deterministic and dependency-free.
    struct HistogramEmbedding;

    #[async_trait]
    impl EmbeddingProvider for HistogramEmbedding {
        async fn create_embedding(
            &self,
            text: &str,
        ) -> Result<Vec<f32>, Box<dyn std::error::Error + Send + Sync>> {
            let mut histogram = vec![0f32; 26];
            for ch in text.to_lowercase().chars() {
                if ch.is_ascii_lowercase() {
                    histogram[(ch as u8 - b'a') as usize] += 1.0;
                }
            }
            Ok(histogram)
        }

        async fn calculate_similarity(
            &self,
            a: &[f32],
            b: &[f32],
        ) -> Result<f64, Box<dyn std::error::Error + Send + Sync>> {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                return Ok(0.0);
            }
            Ok((dot / (norm_a * norm_b)) as f64)
        }
    }

    fn storage() -> ClientStorage {
        let schema = Arc::new(StorageSchema::new("docs", "histogram", |item: &StorageItem| {
            item.payload["text"].as_str().unwrap_or_default().to_string()
        }));
        let embedding = Arc::new(EmbeddingSchema::new("histogram", Arc::new(HistogramEmbedding)));
        let config = Arc::new(RwLock::new(SwarmConfig::default()));
        let logger = SwarmLogger::new(&config.read().unwrap());
        ClientStorage::new("c1", schema, embedding, None, EventBus::new(), logger, config)
    }

    #[tokio::test]
    async fn upsert_replaces_by_id_and_get_finds() {
        let storage = storage();
        storage
            .upsert(StorageItem::new(1u64, serde_json::json!({"text": "alpha"})))
            .await
            .unwrap();
        storage
            .upsert(StorageItem::new(1u64, serde_json::json!({"text": "beta"})))
            .await
            .unwrap();

        assert_eq!(storage.list().await.len(), 1);
        let item = storage.get(&ItemId::Number(1)).await.unwrap();
        assert_eq!(item.payload["text"], "beta");

        storage.remove(&ItemId::Number(1)).await.unwrap();
        assert!(storage.get(&ItemId::Number(1)).await.is_none());
    }

    #[tokio::test]
    async fn take_returns_most_similar_items_over_the_floor() {
        let storage = storage();
        storage
            .upsert(StorageItem::new(1u64, serde_json::json!({"text": "refund policy details"})))
            .await
            .unwrap();
        storage
            .upsert(StorageItem::new(2u64, serde_json::json!({"text": "zzzz qqqq xxxx"})))
            .await
            .unwrap();

        let hits = storage.take("refund policy", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, ItemId::Number(1));
    }

    #[tokio::test]
    async fn clear_empties_the_instance() {
        let storage = storage();
        storage
            .upsert(StorageItem::new(1u64, serde_json::json!({"text": "alpha"})))
            .await
            .unwrap();
        storage.clear().await.unwrap();
        assert!(storage.list().await.is_empty());
    }
}
