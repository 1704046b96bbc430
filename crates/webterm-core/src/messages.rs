//! webterm message stream types.
//!
//! Every frame is a JSON text message `{"t": <type>, "p": <payload>}` where the
//! payload is always a string (JSON documents are nested as strings).

use serde::{Deserialize, Serialize};

pub const CLIENT_CONNECT: &str = "connect";
pub const CLIENT_DATA: &str = "d";
pub const CLIENT_RESIZE: &str = "resize";
pub const CLIENT_SUSPEND: &str = "suspend";
pub const CLIENT_DISCONNECT: &str = "disconnect";

pub const SERVER_OUTPUT: &str = "n";
pub const SERVER_GEOMETRY: &str = "s";
pub const SERVER_PARTICIPANTS: &str = "m";

pub const CR_LF: &str = "\r\n";

/// Raw wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub t: String,
    #[serde(default)]
    pub p: String,
}

/// Terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowsCols {
    pub rows: u16,
    pub cols: u16,
}

impl Default for RowsCols {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Payload of `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRowsCols {
    pub token: String,
    pub rows: u16,
    pub cols: u16,
}

/// Decoded client→gateway message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Connect(TokenRowsCols),
    Data(String),
    Resize(RowsCols),
    Suspend { token: String },
    Disconnect { token: String },
}

/// Gateway→client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Backend output or a one-line notice.
    Output(String),
    /// Geometry update pushed to attached viewers.
    Geometry(RowsCols),
    /// Participant list notice.
    Participants(String),
}

impl ServerMessage {
    /// A notice line wrapped in CR/LF.
    pub fn notice(text: &str) -> Self {
        ServerMessage::Output(format!("{CR_LF}{text}{CR_LF}"))
    }
}
