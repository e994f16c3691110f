pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod messenger;
pub mod registry;
pub mod store;

pub use config::{
    Action, AgentConfig, Decision, GatewayConfig, HealthProbe, ListenerConfig, MessengerConfig,
    Policy, PolicyRule, RateLimitConfig, ServiceAuth, ServiceConfig, StorageConfig,
};
pub use dispatch::{DispatchError, HandlerFactory, HandlerRegistry, HttpHandler, ServiceHandler};
pub use engine::{
    Connection, Frame, Gateway, GatewayBuilder, HealthChecks, HealthReport, memory_pair, spawn_tcp,
};
pub use error::{ExecutionErrorKind, GatewayError};
pub use messenger::{ApprovalPrompt, LogMessenger, Messenger, MessengerFactory, MessengerRegistry};
pub use registry::{
    ArgInfo, ArgSpec, RequestSpec, ResponseSpec, ToolDefinition, ToolInfo, ToolRegistry,
    validate_args,
};
pub use store::{
    AuditEntry, InsertOutcome, OfflineResult, PendingRecord, ResolveOutcome, Resolution,
    SqliteStore, Store,
};
