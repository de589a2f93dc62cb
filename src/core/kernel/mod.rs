/// Session kernel - transport-level machinery behind [`crate::core::session::Session`]
///
/// The kernel knows nothing about payload shapes or channel taxonomies. Method
/// names, channel strings and login parameters are opaque values supplied by
/// configuration and by the [`TokenSource`](crate::core::traits::TokenSource).
///
/// # Architecture
///
/// ## Wire
/// - `RpcCodec`: encodes calls and classifies inbound frames
/// - `JsonRpcCodec`: JSON-RPC 2.0 implementation
///
/// ## Registries
/// - `CallRegistry`: correlation IDs, single-assignment result slots, deadlines
/// - `SubscriptionRegistry`: desired channels and their handlers
///
/// ## Connection
/// - `WsTransport`: one physical WebSocket, reader and serialized writer tasks, heartbeat
/// - `Dispatcher`: routes frames in wire order; performs no I/O
/// - `Reconnector`: the state machine, backoff, re-authentication and replay
///
/// ## Authentication
/// - `HmacSigner`: `client_signature` grant
/// - `JwtSigner`: HS256 bearer JWT
/// - `StaticToken`: pre-issued bearer token
///
/// # Flow
///
/// ```text
/// Session::call -> CallRegistry::register -> RpcCodec::encode_call -> TransportHandle::send
/// WsTransport reader -> Dispatcher -> RpcCodec::decode_message -> CallRegistry::resolve
///                                                              \-> SubscriptionRegistry::dispatch
/// ```
///
/// # Custom codec
/// ```rust,no_run
/// use rpcsession::core::kernel::*;
/// use rpcsession::core::errors::SessionError;
/// use rpcsession::core::types::{CallId, InboundFrame};
/// use serde_json::Value;
/// use tokio_tungstenite::tungstenite::Message;
///
/// struct TracingCodec(JsonRpcCodec);
///
/// impl RpcCodec for TracingCodec {
///     fn encode_call(&self, id: CallId, method: &str, params: &Value) -> Result<Message, SessionError> {
///         tracing::debug!(id, method, "encoding call");
///         self.0.encode_call(id, method, params)
///     }
///
///     fn decode_message(&self, message: Message) -> Result<Option<InboundFrame>, SessionError> {
///         self.0.decode_message(message)
///     }
/// }
/// ```
pub mod calls;
pub mod codec;
pub mod dispatch;
pub mod reconnect;
pub mod signer;
pub mod subscriptions;
pub mod ws;

// Re-export key types for convenience
pub use calls::{CallRegistry, CallWaiter};
pub use codec::{JsonRpcCodec, JsonRpcRequest, RpcCodec};
pub use dispatch::{Dispatcher, ErrorSink, LostConnection};
pub use reconnect::{transition, Backoff, Reconnector};
pub use signer::{client_signature, HmacSigner, JwtSigner, StaticToken};
pub use subscriptions::SubscriptionRegistry;
pub use ws::{TransportConfig, TransportEvent, TransportHandle, WsTransport};
