//! Network Layer
//!
//! WebSocket transport for the service. All state lives in `service/`;
//! this layer parses frames, gates operator actions and fans out events.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{authorize_operator, validate_token, AuthConfig, AuthError, OperatorClaims, OperatorKey};
pub use protocol::{ClientMessage, ErrorCode, OperatorAuthResult, ServerError, ServerMessage};
pub use server::{IotServer, IotServerError, ServerConfig};
