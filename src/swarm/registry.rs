//! Name-keyed schema registries.
//!
//! Registration is additive and immutable-by-replace: registering a name
//! twice swaps the schema wholesale, it never merges. Registries answer
//! only "what is registered under this name" — name collisions and
//! cross-references are the validation services' concern.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::swarm::schema::{
    AgentSchema, CompletionSchema, EmbeddingSchema, StateSchema, StorageSchema, SwarmSchema,
    ToolSchema,
};

/// One registry of schemas of type `S`.
pub struct SchemaRegistry<S> {
    kind: &'static str,
    items: RwLock<HashMap<String, Arc<S>>>,
}

impl<S> SchemaRegistry<S> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: RwLock::new(HashMap::new()),
        }
    }

    /// The registry's entity kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Register (or replace) `schema` under `name`.
    pub fn register(&self, name: impl Into<String>, schema: S) -> String {
        let name = name.into();
        self.items
            .write()
            .expect("registry lock poisoned")
            .insert(name.clone(), Arc::new(schema));
        name
    }

    pub fn get(&self, name: &str) -> Option<Arc<S>> {
        self.items
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }
}

/// The full registry set of one runtime instance.
pub struct SwarmRegistries {
    pub agents: SchemaRegistry<AgentSchema>,
    pub tools: SchemaRegistry<ToolSchema>,
    pub swarms: SchemaRegistry<SwarmSchema>,
    pub completions: SchemaRegistry<CompletionSchema>,
    pub embeddings: SchemaRegistry<EmbeddingSchema>,
    pub storages: SchemaRegistry<StorageSchema>,
    pub states: SchemaRegistry<StateSchema>,
}

impl SwarmRegistries {
    pub fn new() -> Self {
        Self {
            agents: SchemaRegistry::new("agent"),
            tools: SchemaRegistry::new("tool"),
            swarms: SchemaRegistry::new("swarm"),
            completions: SchemaRegistry::new("completion"),
            embeddings: SchemaRegistry::new("embedding"),
            storages: SchemaRegistry::new("storage"),
            states: SchemaRegistry::new("state"),
        }
    }
}

impl Default for SwarmRegistries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_existing_schema() {
        let registry: SchemaRegistry<SwarmSchema> = SchemaRegistry::new("swarm");
        registry.register("support", SwarmSchema::new("support", "a", ["a"]));
        registry.register("support", SwarmSchema::new("support", "b", ["b"]));

        let schema = registry.get("support").unwrap();
        assert_eq!(schema.default_agent, "b");
        assert!(!registry.contains("sales"));
    }
}
