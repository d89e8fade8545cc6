//! Per-client state cells.
//!
//! A [`ClientState`] is a single JSON value with serialized writes: every
//! `set`/`update` acquires the cell's dispatch lock, runs the schema's
//! middleware chain over the candidate value, persists if configured and
//! fires the write callbacks. Shared schemas resolve to one instance under
//! the reserved `"shared"` client id, so swarm-wide state is serialized the
//! same way.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::swarm::bus::{BusEvent, EventBus, EventContext, EventSource};
use crate::swarm::error::SwarmError;
use crate::swarm::logger::SwarmLogger;
use crate::swarm::persist::StatePersistAdapter;
use crate::swarm::schema::{StateSchema, StateValue};
use crate::swarm::types::{ClientId, StateName};

pub struct ClientState {
    state_name: StateName,
    client_id: ClientId,
    schema: Arc<StateSchema>,
    value: Mutex<Option<StateValue>>,
    persist: Option<Arc<dyn StatePersistAdapter>>,
    bus: EventBus,
    logger: SwarmLogger,
}

impl ClientState {
    pub fn new(
        client_id: impl Into<ClientId>,
        schema: Arc<StateSchema>,
        persist: Option<Arc<dyn StatePersistAdapter>>,
        bus: EventBus,
        logger: SwarmLogger,
    ) -> Self {
        Self {
            state_name: schema.state_name.clone(),
            client_id: client_id.into(),
            schema,
            value: Mutex::new(None),
            persist,
            bus,
            logger,
        }
    }

    /// Load the persisted value (or the default) into the cell. Called
    /// once by the connection layer after construction.
    pub async fn wait_for_init(&self) -> Result<(), SwarmError> {
        let mut initial = None;
        if self.schema.persist {
            if let Some(persist) = &self.persist {
                initial = persist.load_state(&self.state_name, &self.client_id).await?;
            }
        }
        let value = initial
            .unwrap_or_else(|| (self.schema.get_default_state)(&self.client_id, &self.state_name));
        *self.value.lock().await = Some(value);
        if let Some(on_init) = &self.schema.callbacks.on_init {
            on_init(&self.client_id, &self.state_name);
        }
        self.emit_event("init", serde_json::Value::Null).await;
        Ok(())
    }

    async fn emit_event(&self, kind: &str, input: serde_json::Value) {
        self.bus
            .emit(
                &self.client_id,
                BusEvent::new(EventSource::StateBus, self.client_id.clone(), kind)
                    .with_input(input)
                    .with_context(EventContext {
                        state_name: Some(self.state_name.clone()),
                        ..EventContext::default()
                    }),
            )
            .await;
    }

    pub async fn get_state(&self) -> StateValue {
        let mut slot = self.value.lock().await;
        let value = slot
            .get_or_insert_with(|| (self.schema.get_default_state)(&self.client_id, &self.state_name))
            .clone();
        drop(slot);
        if let Some(on_read) = &self.schema.callbacks.on_read {
            on_read(&self.client_id, &self.state_name, &value);
        }
        value
    }

    /// Replace the value. The middleware chain runs over the candidate
    /// before it is stored; the stored value is returned.
    pub async fn set_state(&self, value: StateValue) -> Result<StateValue, SwarmError> {
        let mut slot = self.value.lock().await;
        let mut candidate = value;
        for middleware in &self.schema.middlewares {
            candidate = middleware(candidate, &self.client_id, &self.state_name);
        }
        *slot = Some(candidate.clone());
        drop(slot);

        if self.schema.persist {
            if let Some(persist) = &self.persist {
                persist
                    .save_state(&self.state_name, &self.client_id, &candidate)
                    .await?;
            }
        }
        if let Some(on_write) = &self.schema.callbacks.on_write {
            on_write(&self.client_id, &self.state_name, &candidate);
        }
        self.logger.debug(
            &self.client_id,
            "state set",
            serde_json::json!({"state": self.state_name}),
        );
        self.emit_event("set", candidate.clone()).await;
        Ok(candidate)
    }

    /// Derive the next value from the current one under the dispatch lock.
    pub async fn update_state<F>(&self, dispatch: F) -> Result<StateValue, SwarmError>
    where
        F: FnOnce(StateValue) -> StateValue,
    {
        let current = {
            let mut slot = self.value.lock().await;
            slot.get_or_insert_with(|| {
                (self.schema.get_default_state)(&self.client_id, &self.state_name)
            })
            .clone()
        };
        self.set_state(dispatch(current)).await
    }

    pub async fn dispose(&self) {
        if let Some(on_dispose) = &self.schema.callbacks.on_dispose {
            on_dispose(&self.client_id, &self.state_name);
        }
        self.emit_event("dispose", serde_json::Value::Null).await;
    }
}
