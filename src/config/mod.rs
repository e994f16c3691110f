mod policy;

pub use policy::{Action, Decision, Policy, PolicyRule};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level gateway configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: ListenerConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub messenger: MessengerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub policy: Policy,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// How long a pending approval waits for a human before timing out
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,

    /// Interval of the background sweep for expired pending approvals
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Services reachable through the gateway, keyed by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway: ListenerConfig::default(),
            agent: AgentConfig::default(),
            messenger: MessengerConfig::default(),
            storage: StorageConfig::default(),
            policy: Policy::default(),
            rate_limit: RateLimitConfig::default(),
            approval_timeout_secs: default_approval_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            services: BTreeMap::new(),
        }
    }
}

/// Bind address and connection-level settings for the agent channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// TLS material handed to the fronting terminator; omission requires
    /// `allow_insecure`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Explicitly permit binding without TLS material
    #[serde(default)]
    pub allow_insecure: bool,

    /// Seconds an unauthenticated connection may live before the first
    /// auth message must have arrived
    #[serde(default = "default_auth_deadline_secs")]
    pub auth_deadline_secs: u64,

    /// Port for the unauthenticated health endpoint; disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_port: Option<u16>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: None,
            allow_insecure: false,
            auth_deadline_secs: default_auth_deadline_secs(),
            health_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Shared-bearer identity of the connecting agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Shared bearer token the agent presents during the handshake
    #[serde(default)]
    pub token: String,

    /// Identity the offline result queue is keyed by
    #[serde(default = "default_agent_id")]
    pub id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            id: default_agent_id(),
        }
    }
}

/// Messenger adapter selection plus adapter-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    #[serde(rename = "type", default = "default_messenger_type")]
    pub kind: String,

    /// Adapter-specific settings, passed through untouched
    #[serde(flatten)]
    pub params: toml::Table,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            kind: default_messenger_type(),
            params: toml::Table::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default = "default_storage_type")]
    pub kind: String,

    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: default_storage_type(),
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Hard ceiling on concurrent pending approvals, gateway-wide
    #[serde(default = "default_max_pending_approvals")]
    pub max_pending_approvals: usize,

    /// Auto-allow budget per rolling minute, gateway-wide
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_pending_approvals: default_max_pending_approvals(),
            max_requests_per_minute: default_max_requests_per_minute(),
        }
    }
}

/// Wiring for one upstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the service
    pub url: String,

    /// Path to the YAML file declaring this service's tools
    pub tools: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ServiceAuth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthProbe>,

    /// HTTP status -> agent-facing message template; `{status}` and
    /// `{body}` are substituted
    #[serde(default)]
    pub errors: BTreeMap<u16, String>,

    /// Handler factory name; defaults to the generic HTTP executor
    #[serde(default = "default_handler")]
    pub handler: String,

    #[serde(default = "default_service_timeout_secs")]
    pub timeout_secs: u64,
}

/// How the gateway authenticates to a service. Credentials never leave
/// the gateway; Debug output redacts them.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum ServiceAuth {
    Bearer { token: String },
    Header { header: String, value: String },
    Query { param: String, value: String },
    Basic { username: String, password: String },
}

impl std::fmt::Debug for ServiceAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer { .. } => f.debug_struct("Bearer").field("token", &"[REDACTED]").finish(),
            Self::Header { header, .. } => f
                .debug_struct("Header")
                .field("header", header)
                .field("value", &"[REDACTED]")
                .finish(),
            Self::Query { param, .. } => f
                .debug_struct("Query")
                .field("param", param)
                .field("value", &"[REDACTED]")
                .finish(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Service liveness probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbe {
    #[serde(default = "default_health_method")]
    pub method: String,

    #[serde(default = "default_health_path")]
    pub path: String,

    /// Exact status expected; any 2xx counts when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self {
            method: default_health_method(),
            path: default_health_path(),
            expected_status: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_auth_deadline_secs() -> u64 {
    10
}

fn default_agent_id() -> String {
    "default".to_string()
}

fn default_messenger_type() -> String {
    "log".to_string()
}

fn default_storage_type() -> String {
    "sqlite".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("toolgate.db")
}

fn default_max_pending_approvals() -> usize {
    10
}

fn default_max_requests_per_minute() -> u32 {
    60
}

fn default_approval_timeout_secs() -> u64 {
    900
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_handler() -> String {
    "http".to_string()
}

fn default_service_timeout_secs() -> u64 {
    30
}

fn default_health_method() -> String {
    "GET".to_string()
}

fn default_health_path() -> String {
    "/".to_string()
}

impl GatewayConfig {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config = config.apply_env_overrides();
        debug!(path = %path.display(), "loaded gateway configuration");
        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(token) = std::env::var("TOOLGATE_AGENT_TOKEN") {
            self.agent.token = token;
        }
        if let Ok(path) = std::env::var("TOOLGATE_DB_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        self
    }

    /// Validate everything that can be checked without touching the
    /// network. Failures here abort startup.
    pub fn validate(&self) -> Result<()> {
        if self.agent.token.is_empty() {
            anyhow::bail!("agent.token must be set (or TOOLGATE_AGENT_TOKEN exported)");
        }

        match &self.gateway.tls {
            Some(tls) => {
                for (label, path) in [("cert", &tls.cert), ("key", &tls.key)] {
                    if !path.exists() {
                        anyhow::bail!(
                            "gateway.tls.{} does not exist: {}",
                            label,
                            path.display()
                        );
                    }
                }
            }
            None => {
                if !self.gateway.allow_insecure {
                    anyhow::bail!(
                        "no gateway.tls material configured; set gateway.allow_insecure = true \
                         to bind without it"
                    );
                }
            }
        }

        if self.storage.kind != "sqlite" {
            anyhow::bail!("unknown storage.type '{}' (expected: sqlite)", self.storage.kind);
        }

        if self.rate_limit.max_requests_per_minute == 0 {
            anyhow::bail!("rate_limit.max_requests_per_minute must be at least 1");
        }

        self.policy.validate()?;

        for (name, service) in &self.services {
            if service.url.is_empty() {
                anyhow::bail!("services.{}.url must be set", name);
            }
        }

        Ok(())
    }

    /// Resolve a service's tools file relative to the config file location.
    pub fn resolve_tools_path(config_dir: &Path, service: &ServiceConfig) -> PathBuf {
        if service.tools.is_absolute() {
            service.tools.clone()
        } else {
            config_dir.join(&service.tools)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [gateway]
        allow_insecure = true

        [agent]
        token = "secret"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: GatewayConfig = toml::from_str(MINIMAL).expect("parse");
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 8787);
        assert_eq!(config.gateway.auth_deadline_secs, 10);
        assert_eq!(config.approval_timeout_secs, 900);
        assert_eq!(config.rate_limit.max_pending_approvals, 10);
        assert_eq!(config.rate_limit.max_requests_per_minute, 60);
        assert_eq!(config.messenger.kind, "log");
        assert_eq!(config.storage.kind, "sqlite");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_token_is_fatal() {
        let config: GatewayConfig = toml::from_str("[gateway]\nallow_insecure = true\n").expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn plaintext_bind_requires_insecure_flag() {
        let config: GatewayConfig = toml::from_str("[agent]\ntoken = \"t\"\n").expect("parse");
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("allow_insecure"));
    }

    #[test]
    fn service_auth_schemes_parse() {
        let raw = r#"
            url = "http://127.0.0.1:8123"
            tools = "ha.yaml"

            [auth]
            scheme = "basic"
            username = "gate"
            password = "hunter2"
        "#;
        let service: ServiceConfig = toml::from_str(raw).expect("parse");
        assert!(matches!(service.auth, Some(ServiceAuth::Basic { .. })));
        assert_eq!(service.handler, "http");
        assert_eq!(service.timeout_secs, 30);
    }

    #[test]
    fn debug_redacts_service_credentials() {
        let auth = ServiceAuth::Bearer {
            token: "very-secret".into(),
        };
        let rendered = format!("{:?}", auth);
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn bad_policy_pattern_fails_validation() {
        let raw = r#"
            [gateway]
            allow_insecure = true

            [agent]
            token = "secret"

            [policy]
            rules = [{ pattern = "oops[", action = "deny" }]
        "#;
        let config: GatewayConfig = toml::from_str(raw).expect("parse");
        assert!(config.validate().is_err());
    }
}
