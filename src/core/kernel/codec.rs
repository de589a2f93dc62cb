use crate::core::errors::SessionError;
use crate::core::types::{CallId, InboundFrame, Notification, RpcError};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for converting calls to wire frames and classifying inbound frames
///
/// Implementations are stateless. Control frames (ping, pong, close) never reach
/// the codec; they are handled at the transport level.
pub trait RpcCodec: Send + Sync + 'static {
    /// Encode an outgoing call into a WebSocket message
    fn encode_call(
        &self,
        id: CallId,
        method: &str,
        params: &Value,
    ) -> Result<Message, SessionError>;

    /// Decode a raw WebSocket message
    ///
    /// # Returns
    /// - `Ok(Some(frame))` - a call response or a notification
    /// - `Ok(None)` - message was ignored by the codec
    /// - `Err(error)` - malformed frame, reported and dropped by the caller
    fn decode_message(&self, message: Message) -> Result<Option<InboundFrame>, SessionError>;
}

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a, T> {
    pub jsonrpc: &'static str,
    pub id: CallId,
    pub method: &'a str,
    pub params: T,
}

impl<'a, T> JsonRpcRequest<'a, T> {
    pub fn new(id: CallId, method: &'a str, params: T) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// JSON-RPC 2.0 codec.
///
/// Inbound frames are classified as:
/// - `{id, result}` / `{id, error: {code, message}}` - call response
/// - `{channel, notification}` - push keyed by channel
/// - `{method: "subscription", params: {channel, data}}` - JSON-RPC subscription push
/// - `{method, params}` without id - server-initiated notice (e.g. heartbeat),
///   delivered on a channel named after the method
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    pub fn new() -> Self {
        Self
    }

    fn parse_text(&self, text: &str) -> Result<InboundFrame, SessionError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SessionError::ProtocolError(format!("Failed to parse JSON: {}", e)))?;

        let Value::Object(mut object) = value else {
            return Err(SessionError::ProtocolError(
                "frame is not a JSON object".to_string(),
            ));
        };

        match object.get("id") {
            Some(Value::Null) | None => {}
            Some(id) => {
                let id = id.as_u64().ok_or_else(|| {
                    SessionError::ProtocolError(format!("non-integer correlation id: {}", id))
                })?;
                return Self::parse_response(id, &mut object);
            }
        }

        Self::parse_notification(object)
    }

    fn parse_response(id: CallId, object: &mut Map<String, Value>) -> Result<InboundFrame, SessionError> {
        if let Some(error) = object.remove("error").filter(|e| !e.is_null()) {
            let error: RpcError = serde_json::from_value(error).map_err(|e| {
                SessionError::ProtocolError(format!("malformed error object for id {}: {}", id, e))
            })?;
            return Ok(InboundFrame::Response {
                id,
                result: Err(error),
            });
        }

        match object.remove("result") {
            Some(result) => Ok(InboundFrame::Response {
                id,
                result: Ok(result),
            }),
            None => Err(SessionError::ProtocolError(format!(
                "response {} carries neither result nor error",
                id
            ))),
        }
    }

    fn parse_notification(mut object: Map<String, Value>) -> Result<InboundFrame, SessionError> {
        if let Some(Value::String(channel)) = object.remove("channel") {
            let data = object
                .remove("notification")
                .or_else(|| object.remove("data"))
                .unwrap_or(Value::Null);
            return Ok(InboundFrame::Notification(Notification { channel, data }));
        }

        let Some(Value::String(method)) = object.remove("method") else {
            return Err(SessionError::ProtocolError(
                "frame carries neither id nor channel".to_string(),
            ));
        };
        let mut params = object.remove("params").unwrap_or(Value::Null);

        if method == "subscription" {
            let channel = params
                .get("channel")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    SessionError::ProtocolError("subscription push without channel".to_string())
                })?;
            let data = params.get_mut("data").map(Value::take).unwrap_or(Value::Null);
            return Ok(InboundFrame::Notification(Notification { channel, data }));
        }

        Ok(InboundFrame::Notification(Notification {
            channel: method,
            data: params,
        }))
    }
}

impl RpcCodec for JsonRpcCodec {
    fn encode_call(
        &self,
        id: CallId,
        method: &str,
        params: &Value,
    ) -> Result<Message, SessionError> {
        if method.is_empty() {
            return Err(SessionError::InvalidParameters(
                "method name must not be empty".to_string(),
            ));
        }
        let request = JsonRpcRequest::new(id, method, params);
        Ok(Message::Text(serde_json::to_string(&request)?))
    }

    fn decode_message(&self, message: Message) -> Result<Option<InboundFrame>, SessionError> {
        match message {
            Message::Text(text) => self.parse_text(&text).map(Some),
            Message::Binary(data) => {
                let text = String::from_utf8(data).map_err(|e| {
                    SessionError::ProtocolError(format!("Failed to decode binary: {}", e))
                })?;
                self.parse_text(&text).map(Some)
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(text: &str) -> Result<Option<InboundFrame>, SessionError> {
        JsonRpcCodec.decode_message(Message::Text(text.to_string()))
    }

    #[test]
    fn test_encode_call() {
        let message = JsonRpcCodec
            .encode_call(42, "private/buy", &json!({"instrument_name": "BTC-PERPETUAL"}))
            .unwrap();

        let Message::Text(text) = message else {
            panic!("Expected text message");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 42);
        assert_eq!(value["method"], "private/buy");
        assert_eq!(value["params"]["instrument_name"], "BTC-PERPETUAL");
    }

    #[test]
    fn test_encode_rejects_empty_method() {
        assert!(JsonRpcCodec.encode_call(1, "", &Value::Null).is_err());
    }

    #[test]
    fn test_decode_result_and_null_result() {
        let frame = decode(r#"{"jsonrpc":"2.0","id":7,"result":{"order_id":"abc"}}"#).unwrap();
        assert_eq!(
            frame,
            Some(InboundFrame::Response {
                id: 7,
                result: Ok(json!({"order_id": "abc"}))
            })
        );

        let frame = decode(r#"{"jsonrpc":"2.0","id":8,"result":null}"#).unwrap();
        assert_eq!(
            frame,
            Some(InboundFrame::Response {
                id: 8,
                result: Ok(Value::Null)
            })
        );
    }

    #[test]
    fn test_decode_error_response() {
        let frame =
            decode(r#"{"id":9,"error":{"code":10009,"message":"not_enough_funds"}}"#).unwrap();
        let Some(InboundFrame::Response { id, result: Err(error) }) = frame else {
            panic!("Expected error response");
        };
        assert_eq!(id, 9);
        assert_eq!(error.code, 10009);
        assert_eq!(error.message, "not_enough_funds");
    }

    #[test]
    fn test_decode_channel_notification() {
        let frame = decode(r#"{"channel":"book.X","notification":{"bids":[]}}"#).unwrap();
        assert_eq!(
            frame,
            Some(InboundFrame::Notification(Notification {
                channel: "book.X".to_string(),
                data: json!({"bids": []}),
            }))
        );
    }

    #[test]
    fn test_decode_jsonrpc_subscription_push() {
        let frame = decode(
            r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"trades.BTC-PERPETUAL.raw","data":[1,2]}}"#,
        )
        .unwrap();
        let Some(InboundFrame::Notification(notification)) = frame else {
            panic!("Expected notification");
        };
        assert_eq!(notification.channel, "trades.BTC-PERPETUAL.raw");
        assert_eq!(notification.data, json!([1, 2]));
    }

    #[test]
    fn test_decode_method_notice_uses_method_as_channel() {
        let frame = decode(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#)
            .unwrap();
        let Some(InboundFrame::Notification(notification)) = frame else {
            panic!("Expected notification");
        };
        assert_eq!(notification.channel, "heartbeat");
        assert_eq!(notification.data["type"], "test_request");
    }

    #[test]
    fn test_decode_malformed_frames() {
        assert!(decode("not json").is_err());
        assert!(decode("[1,2,3]").is_err());
        assert!(decode(r#"{"foo":"bar"}"#).is_err());
        assert!(decode(r#"{"id":"abc","result":1}"#).is_err());
        assert!(decode(r#"{"id":3}"#).is_err());
    }

    #[test]
    fn test_control_frames_are_ignored() {
        assert!(JsonRpcCodec
            .decode_message(Message::Ping(vec![1]))
            .unwrap()
            .is_none());
    }
}
