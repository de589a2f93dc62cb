use crate::core::types::ConnectionState;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Connection-scoped failure detail carried by [`SessionError::ConnectionError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFailure {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("connection lost: {0}")]
    Lost(String),

    #[error("no pong or traffic within {0:?} of ping")]
    PingTimeout(Duration),

    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    #[error("closed by caller")]
    ClosedByCaller,

    #[error("session not ready (state: {0})")]
    NotReady(ConnectionState),

    #[error("session is closed")]
    Closed,
}

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    ConnectionError(ConnectionFailure),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Call {method} timed out after {after:?}")]
    TimeoutError { method: String, after: Duration },

    #[error("API error: {code} - {message}")]
    ApiError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

impl SessionError {
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionError(ConnectionFailure::Lost(reason.into()))
    }

    /// Errors that drive the reconnector and are broadcast to every pending call.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, Self::ConnectionError(_) | Self::AuthError(_))
    }

    /// Errors that belong to a single call and never affect connection health.
    pub fn is_call_scoped(&self) -> bool {
        matches!(self, Self::TimeoutError { .. } | Self::ApiError { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }
}

impl From<ConnectionFailure> for SessionError {
    fn from(failure: ConnectionFailure) -> Self {
        Self::ConnectionError(failure)
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(error: serde_json::Error) -> Self {
        Self::ProtocolError(format!("JSON error: {}", error))
    }
}

impl From<tungstenite::Error> for SessionError {
    fn from(error: tungstenite::Error) -> Self {
        Self::ConnectionError(ConnectionFailure::Lost(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes_are_disjoint() {
        let lost = SessionError::connection_lost("reset by peer");
        assert!(lost.is_connection_scoped());
        assert!(!lost.is_call_scoped());

        let api = SessionError::ApiError {
            code: 10009,
            message: "not_enough_funds".to_string(),
            data: None,
        };
        assert!(api.is_call_scoped());
        assert!(!api.is_connection_scoped());

        let timeout = SessionError::TimeoutError {
            method: "private/buy".to_string(),
            after: Duration::from_millis(50),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.is_call_scoped());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = SessionError::from(ConnectionFailure::ReconnectExhausted { attempts: 3 });
        assert_eq!(
            err.to_string(),
            "Connection error: reconnect attempts exhausted after 3 tries"
        );

        let err = SessionError::from(ConnectionFailure::NotReady(ConnectionState::Reconnecting));
        assert!(err.to_string().contains("Reconnecting"));
    }

    #[test]
    fn test_json_error_maps_to_protocol() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(
            SessionError::from(parse),
            SessionError::ProtocolError(_)
        ));
    }
}
