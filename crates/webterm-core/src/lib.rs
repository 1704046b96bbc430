//! webterm-core: Shared protocol library for the web terminal gateway.
//!
//! Provides the JSON message envelope and codec, the handshake request and
//! response types, session classification enums, and the error taxonomy.

pub mod codec;
pub mod error;
pub mod messages;
pub mod request;

// Re-export commonly used items at crate root.
pub use codec::{decode_client, encode_client, encode_server, Utf8Carry};
pub use error::{GatewayError, GatewayResult};
pub use messages::{ClientMessage, Envelope, RowsCols, ServerMessage, TokenRowsCols, CR_LF};
pub use request::{
    AuditLogging, ConnectionType, SessionType, TokenRequest, TokenResponse, TokenStatus,
    DEFAULT_FONT_SIZE, PASSWORD_MASK, ROLE_ADMIN,
};
