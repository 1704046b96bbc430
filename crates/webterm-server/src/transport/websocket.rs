//! WebSocket listener using tokio-tungstenite.
//!
//! Each accepted browser connection carries one JSON text-frame message
//! stream for exactly one session.

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use webterm_core::{GatewayError, GatewayResult};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> GatewayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GatewayError::Config(format!("WS bind failed: {e}")))?;
    let local = tcp_listener.local_addr()?;

    info!(addr = %local, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local, rx))
}

/// Maximum accepted client frame (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Receive the next text frame from the read half.
///
/// Returns `None` when the peer closes. Binary and control frames are skipped;
/// pings are answered by tungstenite when the write half is next flushed.
pub async fn ws_recv_text(
    ws: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> GatewayResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_WS_FRAME_SIZE {
                    return Err(GatewayError::ProtocolDecode(format!(
                        "WS frame too large: {} bytes (max {})",
                        text.len(),
                        MAX_WS_FRAME_SIZE
                    )));
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(GatewayError::Other(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
