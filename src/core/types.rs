use crate::core::errors::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Correlation ID linking an outgoing call to its response.
pub type CallId = u64;

/// Lifetime counter of physical connections; bumped on every (re)connect.
pub type Epoch = u64;

/// Final result delivered to a caller waiting on a call.
pub type CallOutcome = Result<Value, SessionError>;

/// Lifecycle of a session's single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// States that are on their way to `Ready` without caller intervention.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Authenticating => "Authenticating",
            Self::Ready => "Ready",
            Self::Reconnecting => "Reconnecting",
            Self::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// Caller asked to connect.
    ConnectRequested,
    /// Transport finished its handshake.
    TransportConnected,
    /// Login resolved successfully and subscriptions were replayed.
    LoginSucceeded,
    /// Login was rejected and no auth retry budget remains.
    AuthRejected,
    /// A dial, login or replay attempt failed in a retryable way.
    AttemptFailed,
    /// Transport reported the connection gone.
    ConnectionLost,
    /// Backoff wait finished; dial again.
    BackoffElapsed,
    /// Stop retrying and wait for the caller (initial connect or auto-reconnect off).
    Abandon,
    /// Reconnect attempt budget exceeded.
    AttemptsExhausted,
    /// Caller closed the session.
    CloseRequested,
}

/// What `call` does when the session is not `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPolicy {
    /// Reject immediately with a connection error.
    #[default]
    FailFast,
    /// Wait for `Ready`, bounded by the call's own timeout.
    Queue,
}

/// Growth of the wait between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// `base * attempt`
    #[default]
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

/// Structured error object from a call response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcError> for SessionError {
    fn from(error: RpcError) -> Self {
        Self::ApiError {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Unsolicited push from the venue, keyed by channel name.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub channel: String,
    pub data: Value,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response {
        id: CallId,
        result: Result<Value, RpcError>,
    },
    Notification(Notification),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Ready.is_ready());
        assert!(ConnectionState::Closed.is_closed());
        assert!(ConnectionState::Reconnecting.is_transitional());
        assert!(!ConnectionState::Disconnected.is_transitional());
        assert_eq!(ConnectionState::Authenticating.to_string(), "Authenticating");
    }

    #[test]
    fn test_policies_deserialize_snake_case() {
        let policy: RequestPolicy = serde_json::from_str("\"queue\"").unwrap();
        assert_eq!(policy, RequestPolicy::Queue);
        let backoff: BackoffPolicy = serde_json::from_str("\"exponential\"").unwrap();
        assert_eq!(backoff, BackoffPolicy::Exponential);
    }

    #[test]
    fn test_rpc_error_becomes_api_error() {
        let err: SessionError = RpcError {
            code: 13009,
            message: "unauthorized".to_string(),
            data: None,
        }
        .into();
        assert!(matches!(err, SessionError::ApiError { code: 13009, .. }));
    }
}
