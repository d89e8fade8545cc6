//! Pluggable structured logging.
//!
//! The runtime never prints directly; everything funnels through a
//! [`LoggerAdapter`] held by the facade. The default adapter forwards to
//! the `log` crate facade so that `env_logger` (or any other subscriber)
//! picks records up without extra wiring. Embedders that need per-client
//! log routing inject their own adapter via `use_logger`.

use std::sync::{Arc, RwLock};

use crate::swarm::config::SwarmConfig;

/// Sink for runtime log records.
///
/// Methods are synchronous by design — they are called from deep inside
/// turn execution and must never suspend the caller.
pub trait LoggerAdapter: Send + Sync {
    /// Plain operational record.
    fn log(&self, client_id: &str, topic: &str, detail: &serde_json::Value);

    /// Verbose record, gated by the `logger_enable_debug` config flag.
    fn debug(&self, client_id: &str, topic: &str, detail: &serde_json::Value);

    /// Informational record, gated by the `logger_enable_info` config flag.
    fn info(&self, client_id: &str, topic: &str, detail: &serde_json::Value);
}

/// Default adapter: forwards to the `log` crate.
pub struct LogCrateAdapter;

impl LoggerAdapter for LogCrateAdapter {
    fn log(&self, client_id: &str, topic: &str, detail: &serde_json::Value) {
        if log::log_enabled!(log::Level::Warn) {
            log::warn!("[{}] {} {}", client_id, topic, detail);
        }
    }

    fn debug(&self, client_id: &str, topic: &str, detail: &serde_json::Value) {
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("[{}] {} {}", client_id, topic, detail);
        }
    }

    fn info(&self, client_id: &str, topic: &str, detail: &serde_json::Value) {
        if log::log_enabled!(log::Level::Info) {
            log::info!("[{}] {} {}", client_id, topic, detail);
        }
    }
}

/// Shared logger slot consulted by every component.
///
/// Cheap to clone; the adapter and the gating flags live behind locks so
/// that `use_logger` / `set_config` affect in-flight components.
#[derive(Clone)]
pub struct SwarmLogger {
    adapter: Arc<RwLock<Arc<dyn LoggerAdapter>>>,
    flags: Arc<RwLock<LogFlags>>,
}

#[derive(Clone, Copy)]
struct LogFlags {
    log: bool,
    debug: bool,
    info: bool,
}

impl SwarmLogger {
    pub fn new(config: &SwarmConfig) -> Self {
        Self {
            adapter: Arc::new(RwLock::new(Arc::new(LogCrateAdapter))),
            flags: Arc::new(RwLock::new(LogFlags {
                log: config.logger_enable_log,
                debug: config.logger_enable_debug,
                info: config.logger_enable_info,
            })),
        }
    }

    /// Replace the sink.
    pub fn use_adapter(&self, adapter: Arc<dyn LoggerAdapter>) {
        *self.adapter.write().expect("logger adapter lock poisoned") = adapter;
    }

    /// Re-read the gating flags after a config change.
    pub fn sync_flags(&self, config: &SwarmConfig) {
        *self.flags.write().expect("logger flags lock poisoned") = LogFlags {
            log: config.logger_enable_log,
            debug: config.logger_enable_debug,
            info: config.logger_enable_info,
        };
    }

    pub fn log(&self, client_id: &str, topic: &str, detail: serde_json::Value) {
        if self.flags.read().expect("logger flags lock poisoned").log {
            self.adapter
                .read()
                .expect("logger adapter lock poisoned")
                .log(client_id, topic, &detail);
        }
    }

    pub fn debug(&self, client_id: &str, topic: &str, detail: serde_json::Value) {
        if self.flags.read().expect("logger flags lock poisoned").debug {
            self.adapter
                .read()
                .expect("logger adapter lock poisoned")
                .debug(client_id, topic, &detail);
        }
    }

    pub fn info(&self, client_id: &str, topic: &str, detail: serde_json::Value) {
        if self.flags.read().expect("logger flags lock poisoned").info {
            self.adapter
                .read()
                .expect("logger adapter lock poisoned")
                .info(client_id, topic, &detail);
        }
    }
}
