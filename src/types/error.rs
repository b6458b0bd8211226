//! Error types for Stagehand

/// Main error type for Stagehand operations
#[derive(Debug, thiserror::Error)]
pub enum StagehandError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Credential store error: {0}")]
    Credential(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StagehandError {
    /// Whether this error means the underlying socket can no longer be
    /// trusted. Transport-level failures downgrade the connection to
    /// disconnected; application-level errors do not.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Timeout(_))
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for StagehandError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for StagehandError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("JSON error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StagehandError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type alias for Stagehand operations
pub type Result<T> = std::result::Result<T, StagehandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(StagehandError::WebSocket("closed".into()).is_transport());
        assert!(StagehandError::Timeout("reply".into()).is_transport());
        assert!(!StagehandError::Protocol("bad field".into()).is_transport());
        assert!(!StagehandError::Config("no host".into()).is_transport());
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let converted: StagehandError = err.into();
        assert!(matches!(converted, StagehandError::Protocol(_)));
    }
}
