mod log;

pub use log::LogMessenger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::MessengerConfig;

/// The human-facing approval request handed to an adapter.
#[derive(Debug, Clone)]
pub struct ApprovalPrompt {
    pub request_id: String,
    pub tool_name: String,
    /// Concise human-readable form of the request
    pub signature: String,
    pub args: Value,
    pub expires_at: DateTime<Utc>,
}

/// Adapter that presents approval requests to the authorized guardians.
///
/// Decisions do not come back through `request_approval`: the adapter's
/// transport reports them via the gateway's resolve path, which absorbs
/// duplicates (a guardian clicking approve twice resolves once). The
/// adapter is responsible for rejecting callbacks from principals outside
/// its configured identity list.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Fire the approval prompt. Failures are logged and the request is
    /// left to time out; they never fail the request outright.
    async fn request_approval(&self, prompt: ApprovalPrompt) -> anyhow::Result<()>;

    /// The request is gone (timed out or resolved elsewhere); any UI the
    /// adapter still shows for it should flip to an expired notice.
    async fn notify_expired(&self, request_id: &str);

    async fn health_check(&self) -> bool;

    async fn close(&self) {}
}

/// Constructor for a named messenger implementation.
pub type MessengerFactory =
    Box<dyn Fn(&MessengerConfig) -> anyhow::Result<Arc<dyn Messenger>> + Send + Sync>;

/// Startup registry of messenger factories, keyed by `messenger.type`.
pub struct MessengerRegistry {
    factories: HashMap<String, MessengerFactory>,
}

impl MessengerRegistry {
    /// Create a registry with the `log` adapter built in.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("log", Box::new(|_config| {
            Ok(Arc::new(LogMessenger::new()) as Arc<dyn Messenger>)
        }));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: MessengerFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn build(&self, config: &MessengerConfig) -> anyhow::Result<Arc<dyn Messenger>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown messenger type '{}' (registered: {})",
                config.kind,
                self.names().join(", ")
            )
        })?;
        factory(config)
    }

    fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for MessengerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_adapter_registered_by_default() {
        let registry = MessengerRegistry::new();
        assert!(registry.build(&MessengerConfig::default()).is_ok());
    }

    #[test]
    fn unknown_adapter_is_fatal() {
        let registry = MessengerRegistry::new();
        let config = MessengerConfig {
            kind: "carrier-pigeon".to_string(),
            params: toml::Table::new(),
        };
        let err = registry.build(&config).err().unwrap().to_string();
        assert!(err.contains("unknown messenger type"));
    }
}
