use std::time::Duration;

use thiserror::Error;

/// Result alias used across the hub.
pub type HubResult<T> = Result<T, HubError>;

/// Represents errors that can occur while bridging and dispatching tools.
#[derive(Error, Debug)]
pub enum HubError {
    /// Malformed or colliding backend descriptors. Fatal at startup.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Backend unreachable or handshake failure.
    #[error("Failed to connect to backend '{prefix}': {reason}")]
    Connect { prefix: String, reason: String },
    /// Listing tools failed after the session was established.
    #[error("Failed to list tools of backend '{prefix}': {reason}")]
    Catalog { prefix: String, reason: String },
    /// A forwarded call did not complete within its bound.
    #[error("Tool '{tool}' did not respond within {}s", .timeout.as_secs_f64())]
    InvocationTimeout { tool: String, timeout: Duration },
    /// The backend process exited or its pipe closed.
    #[error("Transport to backend '{0}' is closed")]
    TransportClosed(String),
    /// I/O or HTTP failure on an open session.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The backend answered with an error or a malformed response.
    #[error("Backend error: {0}")]
    Backend(String),
    /// No handler is registered under the requested name.
    #[error("Tool not found: {0}")]
    UnknownTool(String),
    /// A handler is already registered under the requested name.
    #[error("Tool already registered: {0}")]
    DuplicateTool(String),
    /// Arguments rejected by the tool's validated schema.
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
}

impl HubError {
    /// Stable tag for the error variant, used in structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::Config(_) => "config_error",
            HubError::Connect { .. } => "connect_error",
            HubError::Catalog { .. } => "catalog_error",
            HubError::InvocationTimeout { .. } => "invocation_timeout",
            HubError::TransportClosed(_) => "transport_closed",
            HubError::Transport(_) => "transport_error",
            HubError::Backend(_) => "backend_error",
            HubError::UnknownTool(_) => "unknown_tool",
            HubError::DuplicateTool(_) => "duplicate_tool",
            HubError::InvalidArguments { .. } => "invalid_arguments",
        }
    }

    /// Whether the failure belongs to a single backend and must be contained by the bridge.
    pub fn is_backend_local(&self) -> bool {
        matches!(
            self,
            HubError::Connect { .. }
                | HubError::Catalog { .. }
                | HubError::InvocationTimeout { .. }
                | HubError::TransportClosed(_)
                | HubError::Transport(_)
                | HubError::Backend(_)
        )
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        HubError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Backend(format!("malformed message: {}", err))
    }
}
