//! Browser-facing transport: WebSocket listener and per-socket writer.

pub mod sink;
pub mod websocket;

pub use sink::{ClientSink, Offer, SinkCommand};
pub use websocket::{start_listener, ws_recv_text, WebSocketConnection};
