use crate::core::{errors::SessionError, types::Notification};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// Consumer of one channel's notifications.
///
/// Invoked synchronously on the dispatcher task, so implementations must be fast
/// or hand the payload off to their own queue (see [`ChannelHandler`]).
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, notification: Notification);
}

impl<F> NotificationHandler for F
where
    F: Fn(Notification) + Send + Sync,
{
    fn handle(&self, notification: Notification) {
        self(notification);
    }
}

/// Hands notifications off to an unbounded queue drained by the caller.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationHandler for ChannelHandler {
    fn handle(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!("Notification receiver dropped");
        }
    }
}

/// Observer for connection, auth and protocol errors. Observability only.
pub trait ErrorObserver: Send + Sync {
    fn on_error(&self, error: &SessionError);
}

impl<F> ErrorObserver for F
where
    F: Fn(&SessionError) + Send + Sync,
{
    fn on_error(&self, error: &SessionError) {
        self(error);
    }
}

/// Login parameters minted by a [`TokenSource`]; opaque to the session core.
#[derive(Clone)]
pub struct AuthToken {
    params: Value,
}

impl AuthToken {
    pub fn new(params: Value) -> Self {
        Self { params }
    }

    pub fn into_params(self) -> Value {
        self.params
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

/// Credential collaborator, asked for a fresh token on every (re)authentication.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn mint_token(&self) -> Result<AuthToken, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_handler_preserves_order() {
        let (handler, mut rx) = ChannelHandler::new();
        for i in 0..3 {
            handler.handle(Notification {
                channel: "ticker.BTC-PERPETUAL.raw".to_string(),
                data: json!(i),
            });
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap().data, json!(i));
        }
    }

    #[test]
    fn test_auth_token_debug_is_redacted() {
        let token = AuthToken::new(json!({ "access_token": "abc123" }));
        assert!(!format!("{:?}", token).contains("abc123"));
    }
}
