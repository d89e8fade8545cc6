//! Runtime configuration.
//!
//! [`SwarmConfig`] collects every tunable the runtime consults at execution
//! time: rescue behavior, history truncation, storage search parameters,
//! logger gates, persistence adapters and the default output hygiene
//! filters. A config lives behind the facade and is adjusted with
//! [`ConfigUpdate`] — a partial overlay where every field is optional, so
//! embedders override only what they care about.
//!
//! # Example
//!
//! ```rust
//! use agent_swarm::{ConfigUpdate, RescueStrategy};
//!
//! let update = ConfigUpdate::new()
//!     .rescue_strategy(RescueStrategy::Recomplete)
//!     .keep_messages(50);
//! ```

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use lazy_static::lazy_static;

use crate::swarm::persist::{StatePersistAdapter, StoragePersistAdapter, SwarmPersistAdapter};
use crate::swarm::schema::{MessageMap, OutputTransform, OutputValidator};
use crate::swarm::types::{AgentName, ClientId, ModelMessage};

/// Global history projection predicate: `true` keeps the message in the
/// completion projection built for `agent_name`.
pub type HistoryFilter = Arc<dyn Fn(&ModelMessage, &AgentName) -> bool + Send + Sync>;

lazy_static! {
    /// Process-wide identifier stamped into session contexts.
    pub static ref PROCESS_UUID: String = uuid::Uuid::new_v4().to_string();
}

/// Live configuration shared across the runtime's components.
pub type SharedConfig = Arc<std::sync::RwLock<SwarmConfig>>;

/// Default canned replies returned by the flush rescue strategy.
const DEFAULT_PLACEHOLDERS: [&str; 5] = [
    "Sorry, I got lost there. Could you repeat that?",
    "I didn't quite catch that. Can you say it again?",
    "Something went sideways on my end. Please rephrase your request.",
    "Let's try that once more — what would you like me to do?",
    "Apologies, I need you to repeat that last message.",
];

const DEFAULT_FLUSH_PROMPT: &str =
    "Ignore the previous tool output. Start over and answer the user's last request directly.";

const DEFAULT_RECOMPLETE_PROMPT: &str =
    "Your previous answer was not valid. Respond again with a plain, well-formed reply to the user's last request.";

/// How the runtime recovers when the model produces unusable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescueStrategy {
    /// Reset the conversation projection and answer with a placeholder.
    Flush,
    /// Ask the model again with a corrective prompt appended to history.
    Recomplete,
    /// Delegate to [`SwarmConfig::rescue_custom`].
    Custom,
}

/// Callback invoked by the [`RescueStrategy::Custom`] strategy. Must
/// produce the replacement message for the broken turn.
pub type RescueFn = Arc<
    dyn Fn(ClientId, AgentName) -> BoxFuture<'static, Result<ModelMessage, Box<dyn Error + Send + Sync>>>
        + Send
        + Sync,
>;

/// All runtime tunables, with defaults suitable for development.
#[derive(Clone)]
pub struct SwarmConfig {
    /// Active rescue strategy.
    pub rescue_strategy: RescueStrategy,
    /// Synthetic user prompt appended by the flush strategy.
    pub rescue_flush_prompt: String,
    /// Synthetic user prompt appended by the recomplete strategy.
    pub rescue_recomplete_prompt: String,
    /// Replacement-message factory for the custom strategy.
    pub rescue_custom: Option<RescueFn>,
    /// Canned replies used when a rescued turn has nothing better to say.
    pub empty_output_placeholders: Vec<String>,
    /// History projection cap: keep the last N filtered messages.
    pub keep_messages: usize,
    /// Seconds a dispatched tool may stay silent before a warning is logged.
    pub tool_watchdog_secs: u64,
    /// Gate for plain `log`-level records from the injected logger.
    pub logger_enable_log: bool,
    /// Gate for debug records.
    pub logger_enable_debug: bool,
    /// Gate for info records.
    pub logger_enable_info: bool,
    /// Minimum similarity score a storage item must reach to be returned.
    pub storage_search_similarity: f64,
    /// Number of top-scored candidates considered before the similarity cut.
    pub storage_search_pool: usize,
    /// Root directory of the default filesystem persistence layout.
    pub persist_base_dir: PathBuf,
    /// Adapter persisting active agent + navigation stack. `None` disables.
    pub swarm_persist: Option<Arc<dyn SwarmPersistAdapter>>,
    /// Adapter persisting state cells, for schemas with `persist = true`.
    pub state_persist: Option<Arc<dyn StatePersistAdapter>>,
    /// Adapter persisting storage data, for schemas with `persist = true`.
    pub storage_persist: Option<Arc<dyn StoragePersistAdapter>>,
    /// Shared system prompt prepended to every agent preamble.
    pub default_system_prompt: Option<String>,
    /// Replaces the built-in history projection predicate for agents.
    pub history_filter: Option<HistoryFilter>,
    /// Fallback output transform for agents without their own.
    pub default_output_transform: Option<OutputTransform>,
    /// Fallback completion-message map for agents without their own.
    pub default_output_map: Option<MessageMap>,
    /// Fallback output validator for agents without their own; the
    /// tag/symbol checks below apply only when this is unset too.
    pub default_validation: Option<OutputValidator>,
    /// Substrings that invalidate model output when present (default
    /// validation; tool-call remnants the model leaked as prose).
    pub disallowed_tags: Vec<String>,
    /// Symbols that invalidate model output when present.
    pub disallowed_symbols: Vec<String>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            rescue_strategy: RescueStrategy::Flush,
            rescue_flush_prompt: DEFAULT_FLUSH_PROMPT.to_string(),
            rescue_recomplete_prompt: DEFAULT_RECOMPLETE_PROMPT.to_string(),
            rescue_custom: None,
            empty_output_placeholders: DEFAULT_PLACEHOLDERS.iter().map(|s| s.to_string()).collect(),
            keep_messages: 25,
            tool_watchdog_secs: 15,
            logger_enable_log: true,
            logger_enable_debug: false,
            logger_enable_info: false,
            storage_search_similarity: 0.65,
            storage_search_pool: 5,
            persist_base_dir: PathBuf::from("./logs/data"),
            swarm_persist: None,
            state_persist: None,
            storage_persist: None,
            default_system_prompt: None,
            history_filter: None,
            default_output_transform: None,
            default_output_map: None,
            default_validation: None,
            disallowed_tags: vec!["tool_call".to_string(), "toolcall".to_string()],
            disallowed_symbols: vec!["{".to_string(), "}".to_string()],
        }
    }
}

impl SwarmConfig {
    /// Pick a placeholder reply. Selection is uniform enough for canned
    /// apologies; it must not require a dedicated RNG dependency.
    pub fn random_placeholder(&self) -> String {
        if self.empty_output_placeholders.is_empty() {
            return String::new();
        }
        let roll = uuid::Uuid::new_v4().as_u128() as usize;
        self.empty_output_placeholders[roll % self.empty_output_placeholders.len()].clone()
    }
}

/// Partial overlay applied onto a [`SwarmConfig`] via `set_config`.
///
/// Construct with [`ConfigUpdate::new`] and chain the setters; unset fields
/// leave the current configuration untouched.
#[derive(Clone, Default)]
pub struct ConfigUpdate {
    pub rescue_strategy: Option<RescueStrategy>,
    pub rescue_flush_prompt: Option<String>,
    pub rescue_recomplete_prompt: Option<String>,
    pub rescue_custom: Option<RescueFn>,
    pub empty_output_placeholders: Option<Vec<String>>,
    pub keep_messages: Option<usize>,
    pub tool_watchdog_secs: Option<u64>,
    pub logger_enable_log: Option<bool>,
    pub logger_enable_debug: Option<bool>,
    pub logger_enable_info: Option<bool>,
    pub storage_search_similarity: Option<f64>,
    pub storage_search_pool: Option<usize>,
    pub persist_base_dir: Option<PathBuf>,
    pub swarm_persist: Option<Arc<dyn SwarmPersistAdapter>>,
    pub state_persist: Option<Arc<dyn StatePersistAdapter>>,
    pub storage_persist: Option<Arc<dyn StoragePersistAdapter>>,
    pub default_system_prompt: Option<String>,
    pub history_filter: Option<HistoryFilter>,
    pub default_output_transform: Option<OutputTransform>,
    pub default_output_map: Option<MessageMap>,
    pub default_validation: Option<OutputValidator>,
    pub disallowed_tags: Option<Vec<String>>,
    pub disallowed_symbols: Option<Vec<String>>,
}

impl ConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rescue_strategy(mut self, strategy: RescueStrategy) -> Self {
        self.rescue_strategy = Some(strategy);
        self
    }

    pub fn rescue_flush_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.rescue_flush_prompt = Some(prompt.into());
        self
    }

    pub fn rescue_recomplete_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.rescue_recomplete_prompt = Some(prompt.into());
        self
    }

    pub fn rescue_custom(mut self, f: RescueFn) -> Self {
        self.rescue_custom = Some(f);
        self
    }

    pub fn empty_output_placeholders(mut self, placeholders: Vec<String>) -> Self {
        self.empty_output_placeholders = Some(placeholders);
        self
    }

    pub fn keep_messages(mut self, keep: usize) -> Self {
        self.keep_messages = Some(keep);
        self
    }

    pub fn tool_watchdog_secs(mut self, secs: u64) -> Self {
        self.tool_watchdog_secs = Some(secs);
        self
    }

    pub fn storage_search_similarity(mut self, similarity: f64) -> Self {
        self.storage_search_similarity = Some(similarity);
        self
    }

    pub fn storage_search_pool(mut self, pool: usize) -> Self {
        self.storage_search_pool = Some(pool);
        self
    }

    pub fn persist_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_base_dir = Some(dir.into());
        self
    }

    pub fn swarm_persist(mut self, adapter: Arc<dyn SwarmPersistAdapter>) -> Self {
        self.swarm_persist = Some(adapter);
        self
    }

    pub fn state_persist(mut self, adapter: Arc<dyn StatePersistAdapter>) -> Self {
        self.state_persist = Some(adapter);
        self
    }

    pub fn storage_persist(mut self, adapter: Arc<dyn StoragePersistAdapter>) -> Self {
        self.storage_persist = Some(adapter);
        self
    }

    pub fn default_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.default_system_prompt = Some(prompt.into());
        self
    }

    pub fn history_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ModelMessage, &AgentName) -> bool + Send + Sync + 'static,
    {
        self.history_filter = Some(Arc::new(filter));
        self
    }

    pub fn default_output_transform(mut self, transform: OutputTransform) -> Self {
        self.default_output_transform = Some(transform);
        self
    }

    pub fn default_output_map(mut self, map: MessageMap) -> Self {
        self.default_output_map = Some(map);
        self
    }

    pub fn default_validation(mut self, validation: OutputValidator) -> Self {
        self.default_validation = Some(validation);
        self
    }

    pub fn disallowed_tags(mut self, tags: Vec<String>) -> Self {
        self.disallowed_tags = Some(tags);
        self
    }

    pub fn disallowed_symbols(mut self, symbols: Vec<String>) -> Self {
        self.disallowed_symbols = Some(symbols);
        self
    }

    /// Merge this overlay into `config`.
    pub fn apply(self, config: &mut SwarmConfig) {
        if let Some(v) = self.rescue_strategy {
            config.rescue_strategy = v;
        }
        if let Some(v) = self.rescue_flush_prompt {
            config.rescue_flush_prompt = v;
        }
        if let Some(v) = self.rescue_recomplete_prompt {
            config.rescue_recomplete_prompt = v;
        }
        if let Some(v) = self.rescue_custom {
            config.rescue_custom = Some(v);
        }
        if let Some(v) = self.empty_output_placeholders {
            config.empty_output_placeholders = v;
        }
        if let Some(v) = self.keep_messages {
            config.keep_messages = v;
        }
        if let Some(v) = self.tool_watchdog_secs {
            config.tool_watchdog_secs = v;
        }
        if let Some(v) = self.logger_enable_log {
            config.logger_enable_log = v;
        }
        if let Some(v) = self.logger_enable_debug {
            config.logger_enable_debug = v;
        }
        if let Some(v) = self.logger_enable_info {
            config.logger_enable_info = v;
        }
        if let Some(v) = self.storage_search_similarity {
            config.storage_search_similarity = v;
        }
        if let Some(v) = self.storage_search_pool {
            config.storage_search_pool = v;
        }
        if let Some(v) = self.persist_base_dir {
            config.persist_base_dir = v;
        }
        if let Some(v) = self.swarm_persist {
            config.swarm_persist = Some(v);
        }
        if let Some(v) = self.state_persist {
            config.state_persist = Some(v);
        }
        if let Some(v) = self.storage_persist {
            config.storage_persist = Some(v);
        }
        if let Some(v) = self.default_system_prompt {
            config.default_system_prompt = Some(v);
        }
        if let Some(v) = self.history_filter {
            config.history_filter = Some(v);
        }
        if let Some(v) = self.default_output_transform {
            config.default_output_transform = Some(v);
        }
        if let Some(v) = self.default_output_map {
            config.default_output_map = Some(v);
        }
        if let Some(v) = self.default_validation {
            config.default_validation = Some(v);
        }
        if let Some(v) = self.disallowed_tags {
            config.disallowed_tags = v;
        }
        if let Some(v) = self.disallowed_symbols {
            config.disallowed_symbols = v;
        }
    }
}

impl ConfigUpdate {
    pub fn logger_enable_log(mut self, enabled: bool) -> Self {
        self.logger_enable_log = Some(enabled);
        self
    }

    pub fn logger_enable_debug(mut self, enabled: bool) -> Self {
        self.logger_enable_debug = Some(enabled);
        self
    }

    pub fn logger_enable_info(mut self, enabled: bool) -> Self {
        self.logger_enable_info = Some(enabled);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_overrides_only_set_fields() {
        let mut config = SwarmConfig::default();
        ConfigUpdate::new()
            .keep_messages(7)
            .rescue_strategy(RescueStrategy::Recomplete)
            .apply(&mut config);

        assert_eq!(config.keep_messages, 7);
        assert_eq!(config.rescue_strategy, RescueStrategy::Recomplete);
        assert_eq!(config.storage_search_pool, 5);
        assert_eq!(config.tool_watchdog_secs, 15);
    }

    #[test]
    fn placeholder_selection_stays_in_table() {
        let config = SwarmConfig::default();
        for _ in 0..32 {
            let p = config.random_placeholder();
            assert!(config.empty_output_placeholders.contains(&p));
        }
    }
}
