pub mod core;

pub use core::config::{CredentialConfig, ProtocolMethods, SessionConfig};
pub use core::errors::{ConnectionFailure, SessionError};
pub use core::kernel::{HmacSigner, JsonRpcCodec, JwtSigner, RpcCodec, StaticToken};
pub use core::session::Session;
pub use core::traits::{AuthToken, ChannelHandler, ErrorObserver, NotificationHandler, TokenSource};
pub use core::types::*;
