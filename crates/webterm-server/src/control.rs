//! Loopback control listener.
//!
//! Stands in for the external HTTP layer: one JSON request per line, one JSON
//! response per line.
//!
//! ```text
//! {"op":"token","request":{"host":"h","connectionType":"ssh",...}}
//! {"op":"sessions","user":"alice"}
//! {"op":"drop","token":"...","webUserName":"alice","webUserRole":"ROLE_USER"}
//! {"op":"pending"}
//! ```

use crate::session::SessionRegistry;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use webterm_core::{GatewayError, GatewayResult, TokenRequest};

/// One control request.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ControlRequest {
    Token {
        request: TokenRequest,
    },
    Sessions {
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Drop {
        token: String,
        web_user_name: String,
        #[serde(default)]
        web_user_role: String,
    },
    Pending,
}

/// Bind the control listener and serve it in the background.
pub async fn start_listener(addr: SocketAddr, registry: SessionRegistry) -> GatewayResult<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Config(format!("control bind failed: {e}")))?;
    let local = listener.local_addr()?;
    info!(addr = %local, "control listener started");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "control client connected");
                    tokio::spawn(serve_client(stream, registry.clone()));
                }
                Err(e) => error!(error = %e, "control accept failed"),
            }
        }
    });

    Ok(local)
}

async fn serve_client(stream: TcpStream, registry: SessionRegistry) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "control read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let mut reply = handle_line(&registry, &line).await.to_string();
        reply.push('\n');
        if let Err(e) = write.write_all(reply.as_bytes()).await {
            warn!(error = %e, "control write failed");
            break;
        }
    }
}

/// Decode and execute one request line.
pub async fn handle_line(registry: &SessionRegistry, line: &str) -> Value {
    let request: ControlRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return json!({ "error": e.to_string() }),
    };
    match request {
        ControlRequest::Token { request } => json!(registry.issue_token(request)),
        ControlRequest::Sessions { user } => json!(registry.visible_sessions(user.as_deref())),
        ControlRequest::Drop {
            token,
            web_user_name,
            web_user_role,
        } => json!(
            registry
                .drop_session(&token, &web_user_name, &web_user_role)
                .await
        ),
        ControlRequest::Pending => json!(registry.pending_tokens()),
    }
}
