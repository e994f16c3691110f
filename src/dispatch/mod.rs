mod http;

pub use http::HttpHandler;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::error::ExecutionErrorKind;
use crate::registry::ToolDefinition;

/// Failure reported by a service handler.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DispatchError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl DispatchError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A backend capable of executing tool requests against one service.
///
/// Handlers receive their service config and owned tool set at
/// construction and are closed on gateway shutdown.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn execute(
        &self,
        tool_name: &str,
        args: &serde_json::Map<String, Value>,
    ) -> Result<Value, DispatchError>;

    async fn health_check(&self) -> bool;

    async fn close(&self) {}
}

/// Constructor for a named handler implementation.
pub type HandlerFactory = Box<
    dyn Fn(&str, &ServiceConfig, Vec<Arc<ToolDefinition>>) -> anyhow::Result<Arc<dyn ServiceHandler>>
        + Send
        + Sync,
>;

/// Startup registry of handler factories, keyed by the config's
/// `handler` name. The escape hatch for non-HTTP services: register a
/// factory under a new name and reference it from the service config.
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// Create a registry with the generic HTTP executor registered as
    /// `http`.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("http", Box::new(|service, config, tools| {
            Ok(Arc::new(HttpHandler::from_config(service, config, tools)?) as Arc<dyn ServiceHandler>)
        }));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: HandlerFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Build the handler a service's config names.
    pub fn build(
        &self,
        service: &str,
        config: &ServiceConfig,
        tools: Vec<Arc<ToolDefinition>>,
    ) -> anyhow::Result<Arc<dyn ServiceHandler>> {
        let factory = self.factories.get(&config.handler).ok_or_else(|| {
            anyhow::anyhow!(
                "services.{}: unknown handler '{}' (registered: {})",
                service,
                config.handler,
                self.names().join(", ")
            )
        })?;
        factory(service, config, tools)
    }

    fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn service_config(handler: &str) -> ServiceConfig {
        ServiceConfig {
            url: "http://127.0.0.1:1".to_string(),
            tools: PathBuf::from("unused.yaml"),
            auth: None,
            health: None,
            errors: Default::default(),
            handler: handler.to_string(),
            timeout_secs: 30,
        }
    }

    #[test]
    fn unknown_handler_is_fatal() {
        let registry = HandlerRegistry::new();
        let err = registry
            .build("svc", &service_config("not-a-handler"), vec![])
            .err()
            .unwrap()
            .to_string();
        assert!(err.contains("unknown handler"));
    }

    #[test]
    fn http_handler_registered_by_default() {
        let registry = HandlerRegistry::new();
        assert!(registry.build("svc", &service_config("http"), vec![]).is_ok());
    }
}
