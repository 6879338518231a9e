/// Shared error type used across all Parlor crates.
///
/// Every variant maps to a stable wire code via [`Error::code`]; clients see
/// `{code, message}` pairs, internal failures (I/O, serde) surface as
/// `internal_error` while the full chain is logged server-side.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("duplicate agent id: {0}")]
    DuplicateAgentId(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session busy: {0}")]
    SessionBusy(String),

    #[error("session name in use: {0}")]
    NameInUse(String),

    #[error("invalid session attributes: {0}")]
    InvalidSessionAttributes(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent not accessible: {0}")]
    AgentNotAccessible(String),

    #[error("agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("agent session error: {0}")]
    AgentSessionError(String),

    #[error("agent message failed: {0}")]
    AgentMessageFailed(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool not allowed: {0}")]
    ToolNotAllowed(String),

    #[error("tool interrupted: {0}")]
    ToolInterrupted(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u32),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("session mismatch: {0}")]
    SessionMismatch(String),

    #[error("external agent error: {0}")]
    ExternalAgentError(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The stable wire code for this error, returned to clients in typed
    /// server messages.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "invalid_config",
            Error::DuplicateAgentId(_) => "duplicate_agent_id",
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionBusy(_) => "session_busy",
            Error::NameInUse(_) => "name_in_use",
            Error::InvalidSessionAttributes(_) => "invalid_session_attributes",
            Error::AgentNotFound(_) => "agent_not_found",
            Error::AgentNotAccessible(_) => "agent_not_accessible",
            Error::AgentNotAvailable(_) => "agent_not_available",
            Error::AgentSessionError(_) => "agent_session_error",
            Error::AgentMessageFailed(_) => "agent_message_failed",
            Error::ToolNotFound(_) => "tool_not_found",
            Error::ToolNotAllowed(_) => "tool_not_allowed",
            Error::ToolInterrupted(_) => "tool_interrupted",
            Error::InvalidArguments(_) => "invalid_arguments",
            Error::RateLimited(_) => "rate_limited",
            Error::UnsupportedProtocolVersion(_) => "unsupported_protocol_version",
            Error::InvalidEvent(_) => "invalid_event",
            Error::SessionMismatch(_) => "session_mismatch",
            Error::ExternalAgentError(_) => "external_agent_error",
            Error::Provider { .. } => "agent_session_error",
            Error::Cancelled => "tool_interrupted",
            Error::Io(_) | Error::Json(_) | Error::Other(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
