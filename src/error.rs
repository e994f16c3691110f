use crate::engine::protocol;

/// Classification attached to an execution failure.
///
/// Persisted in the audit log's `error_kind` column and used to pick
/// service error messages; never sent to the agent verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// The service rejected our credentials
    Auth,
    /// The target resource does not exist
    NotFound,
    /// Network failure or timeout reaching the service
    Connection,
    /// The service answered with something we could not interpret
    Protocol,
    /// Anything else
    Other,
}

impl ExecutionErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors surfaced by the gateway.
///
/// Per-request variants map onto protocol error codes and become terminal
/// resolutions; they never tear down a session. `Config` is startup-only
/// and fatal.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A `tool_request` naming a tool the registry does not know. Same
    /// wire code as `InvalidRequest`, but audited under its own kind.
    #[error("invalid request: {0}")]
    UnknownTool(String),

    /// An envelope method outside the protocol's method set.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("denied by policy: {0}")]
    PolicyDenied(String),

    #[error("denied by user: {0}")]
    UserDenied(String),

    #[error("approval timed out: {0}")]
    TimedOut(String),

    #[error("execution failed ({kind}): {message}")]
    Execution {
        kind: ExecutionErrorKind,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Protocol error code for the agent-facing envelope.
    ///
    /// `Config` never reaches the wire; `Internal` is delivered as a
    /// generic execution failure.
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => protocol::codes::PARSE_ERROR,
            Self::InvalidRequest(_) | Self::UnknownTool(_) => protocol::codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => protocol::codes::METHOD_NOT_FOUND,
            Self::UserDenied(_) => protocol::codes::DENIED_BY_USER,
            Self::TimedOut(_) => protocol::codes::APPROVAL_TIMED_OUT,
            Self::PolicyDenied(_) => protocol::codes::DENIED_BY_POLICY,
            Self::Execution { .. } => protocol::codes::EXECUTION_FAILED,
            Self::NotAuthenticated(_) => protocol::codes::NOT_AUTHENTICATED,
            Self::RateLimited(_) => protocol::codes::RATE_LIMIT_EXCEEDED,
            Self::Config(_) | Self::Internal(_) => protocol::codes::EXECUTION_FAILED,
        }
    }

    /// Short classification label recorded in the audit log.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownTool(_) | Self::MethodNotFound(_) => "method_not_found",
            Self::NotAuthenticated(_) => "not_authenticated",
            Self::RateLimited(_) => "rate_limited",
            Self::PolicyDenied(_) => "policy_denied",
            Self::UserDenied(_) => "user_denied",
            Self::TimedOut(_) => "timed_out",
            Self::Execution { kind, .. } => kind.label(),
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// The short message sent to the agent. Internal detail stays in the log.
    pub fn wire_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}
