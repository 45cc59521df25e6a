//! Error types for Toolmux
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in Toolmux
#[derive(Debug, Error)]
pub enum ToolmuxError {
    /// Stream/connection level failure
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Peer sent something that violates the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Tool call could not be routed
    #[error("Routing error: {0}")]
    Routing(#[from] RouteError),

    /// Relay connection to a primary router failed
    #[error("Relay error: {0}")]
    Relay(String),

    /// Peer failed the shared-secret check
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A UI surface operation failed
    #[error("UI surface error: {0}")]
    Surface(String),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a routed tool call ends without a result from the application.
///
/// The display text is what the agent sees in the failed tool result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Application '{0}' is not connected")]
    AppNotConnected(String),

    #[error("Failed to send invocation to '{app}': {reason}")]
    SendFailed { app: String, reason: String },

    #[error("Tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Application '{0}' disconnected while the call was in flight")]
    Disconnected(String),
}

/// Result type alias for Toolmux operations
pub type Result<T> = std::result::Result<T, ToolmuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_error() {
        let err = ToolmuxError::Ipc("broken pipe".to_string());
        assert_eq!(err.to_string(), "IPC error: broken pipe");
    }

    #[test]
    fn test_relay_error() {
        let err = ToolmuxError::Relay("no ack".to_string());
        assert_eq!(err.to_string(), "Relay error: no ack");
    }

    #[test]
    fn test_route_error_messages() {
        assert_eq!(
            RouteError::ToolNotFound("Ghost:Anything".into()).to_string(),
            "Tool not found: Ghost:Anything"
        );
        assert_eq!(
            RouteError::Timeout {
                tool: "Writer:SaveFile".into(),
                timeout_ms: 30000
            }
            .to_string(),
            "Tool call 'Writer:SaveFile' timed out after 30000ms"
        );
        assert!(
            RouteError::Disconnected("Writer".into())
                .to_string()
                .contains("disconnected")
        );
    }

    #[test]
    fn test_route_error_conversion() {
        let err: ToolmuxError = RouteError::AppNotConnected("Writer".into()).into();
        assert!(matches!(err, ToolmuxError::Routing(_)));
        assert_eq!(
            err.to_string(),
            "Routing error: Application 'Writer' is not connected"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err: ToolmuxError = io_err.into();
        assert!(matches!(err, ToolmuxError::Io(_)));
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: ToolmuxError = json_err.into();
        assert!(matches!(err, ToolmuxError::Json(_)));
    }
}
