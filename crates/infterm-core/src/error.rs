use thiserror::Error;

/// Errors produced by the terminal bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("runspace not found: {0}")]
    RunspaceNotFound(String),

    #[error("PTY spawn failed: {0}")]
    PtySpawn(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unauthorized origin: {0}")]
    UnauthorizedOrigin(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already attached: {0}")]
    SessionBusy(String),

    #[error("max sessions ({0}) reached")]
    SessionLimitReached(usize),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("command blocked: {0}")]
    SecurityBlocked(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Text sent to the client in an `error` frame.
    ///
    /// Internal detail (paths, OS errors) stays in the logs.
    pub fn client_message(&self) -> String {
        match self {
            BridgeError::RunspaceNotFound(_) => "Runspace not found".into(),
            BridgeError::PtySpawn(_) => "Failed to start terminal".into(),
            BridgeError::AuthFailed(_) => "Authentication required".into(),
            BridgeError::UnauthorizedOrigin(_) => "Unauthorized origin".into(),
            BridgeError::SessionNotFound(_) => "Session not found".into(),
            BridgeError::SessionBusy(_) => "Session already attached".into(),
            BridgeError::SessionLimitReached(_) => "Too many sessions".into(),
            BridgeError::RateLimited(_) => "Too many connection attempts".into(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::InvalidMessage(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_hide_detail() {
        let err = BridgeError::RunspaceNotFound("does-not-exist".into());
        assert_eq!(err.client_message(), "Runspace not found");
        let err = BridgeError::PtySpawn("/nope: No such file or directory".into());
        assert_eq!(err.client_message(), "Failed to start terminal");
    }

    #[test]
    fn json_errors_are_invalid_messages() {
        let err: BridgeError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert!(matches!(err, BridgeError::InvalidMessage(_)));
    }
}
