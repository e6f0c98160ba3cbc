//! Clawdeck error types

use thiserror::Error;

/// Clawdeck error type
#[derive(Error, Debug)]
pub enum Error {
    /// A line read from a child process was not valid JSON
    #[error("Parse error: {0}")]
    Parse(String),

    /// A command failed structural validation
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The workspace already has a session in a non-terminal state
    #[error("Workspace {0} already has an active session")]
    WorkspaceBusy(String),

    /// The operation referenced a session that does not exist
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The operation requires a starting or active session
    #[error("Session is not active: {0}")]
    SessionInactive(String),

    /// The vendor reported an authentication failure
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The session consumer loop failed; the session is unusable
    #[error("Message processing error: {0}")]
    MessageProcessing(String),

    /// The bridge child process exited unexpectedly
    #[error("Bridge disconnected")]
    BridgeDisconnected,

    /// Failed to spawn a child process
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    /// Attempted to write to a child process that has exited
    #[error("Process disconnected")]
    Disconnected,

    /// A pending permission request expired
    #[error("Permission request timed out")]
    PermissionTimeout,

    /// The bridge answered a command with an error
    #[error("{0}")]
    Command(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code, carried in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parse(_) => "PARSE_ERROR",
            Error::InvalidCommand(_) => "INVALID_COMMAND",
            Error::WorkspaceBusy(_) => "WORKSPACE_BUSY",
            Error::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Error::SessionInactive(_) => "SESSION_INACTIVE",
            Error::Auth(_) => "AUTH_ERROR",
            Error::MessageProcessing(_) => "MESSAGE_PROCESSING_ERROR",
            Error::BridgeDisconnected => "BRIDGE_DISCONNECTED",
            Error::SpawnFailed(_) => "SPAWN_FAILED",
            Error::Disconnected => "DISCONNECTED",
            Error::PermissionTimeout => "PERMISSION_TIMEOUT",
            Error::Command(_) => "COMMAND_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Registry(_) => "REGISTRY_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the bridge can keep serving other sessions after this error.
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            Error::Auth(_) | Error::MessageProcessing(_) | Error::BridgeDisconnected
        )
    }
}

/// Result type alias for clawdeck operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_stable() {
        assert_eq!(Error::BridgeDisconnected.code(), "BRIDGE_DISCONNECTED");
        assert_eq!(Error::Auth("bad token".into()).code(), "AUTH_ERROR");
        assert_eq!(Error::PermissionTimeout.code(), "PERMISSION_TIMEOUT");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::Parse("oops".into()).recoverable());
        assert!(Error::InvalidCommand("bad".into()).recoverable());
        assert!(!Error::Auth("expired".into()).recoverable());
        assert!(!Error::BridgeDisconnected.recoverable());
        assert!(!Error::MessageProcessing("loop died".into()).recoverable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert_eq!(err.code(), "IO_ERROR");
    }
}
