//! Core server: accepts browser sockets and dispatches their messages to the
//! session registry.
//!
//! Each socket gets a fresh session id, a writer task (via [`ClientSink`]) and
//! a read loop here. The registry owns everything that outlives the socket.

use crate::config::ServerConfig;
use crate::control;
use crate::session::{generate_session_id, SessionRegistry};
use crate::transport::{self, ws_recv_text, ClientSink, WebSocketConnection};
use futures_util::StreamExt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webterm_core::{decode_client, ClientMessage, GatewayResult};

/// The gateway instance.
pub struct GatewayServer {
    config: ServerConfig,
    registry: SessionRegistry,
}

impl GatewayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = SessionRegistry::new(config.registry.clone());
        Self { config, registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Start the listeners and housekeeping, then serve sockets until the
    /// listener goes away.
    pub async fn run(&self) -> GatewayResult<()> {
        let ws_addr = SocketAddr::new(self.config.bind, self.config.port);
        let (local, mut ws_rx) = transport::start_listener(ws_addr).await?;

        let control_addr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.config.control_port);
        let control_local = control::start_listener(control_addr, self.registry.clone()).await?;

        let _housekeeping = spawn_housekeeping(
            self.registry.clone(),
            self.config.token_sweep_interval,
            self.config.idle_sweep_interval,
        );

        info!(ws = %local, control = %control_local, "webterm-server ready");

        while let Some(conn) = ws_rx.recv().await {
            let registry = self.registry.clone();
            tokio::spawn(handle_websocket(registry, conn));
        }

        info!("listener closed, shutting down");
        Ok(())
    }
}

/// Run the idle and token sweeps on their own cadences.
pub fn spawn_housekeeping(
    registry: SessionRegistry,
    token_every: Duration,
    idle_every: Duration,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let tokens = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(token_every);
            loop {
                interval.tick().await;
                registry.sweep_tokens(Instant::now());
            }
        })
    };
    let idle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(idle_every);
        loop {
            interval.tick().await;
            let closed = registry.sweep_idle(Instant::now()).await;
            if closed > 0 {
                info!(closed, "idle sessions closed");
            }
        }
    });
    (tokens, idle)
}

async fn handle_websocket(registry: SessionRegistry, conn: WebSocketConnection) {
    let remote = conn.remote_addr;
    let session_id = generate_session_id();
    info!(remote = %remote, session_id = %session_id, "socket opened");

    let (write, mut read) = conn.ws_stream.split();
    let sink = ClientSink::spawn(write);

    loop {
        match ws_recv_text(&mut read).await {
            Ok(Some(text)) => {
                if !dispatch(&registry, &session_id, &sink, &text).await {
                    break;
                }
            }
            Ok(None) => {
                debug!(session_id = %session_id, "socket closed by peer");
                break;
            }
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "socket read failed");
                break;
            }
        }
    }

    registry.socket_closed(&session_id).await;
    sink.close();
    info!(remote = %remote, session_id = %session_id, "socket finished");
}

/// Handle one client message. Returns false when the socket should stop.
async fn dispatch(
    registry: &SessionRegistry,
    session_id: &str,
    sink: &ClientSink,
    text: &str,
) -> bool {
    let msg = match decode_client(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(session_id, error = %e, "bad client message");
            return fail(registry, session_id, sink, &e.to_string()).await;
        }
    };

    let outcome = match msg {
        ClientMessage::Connect(connect) => {
            if registry.get(session_id).is_some() {
                debug!(session_id, "duplicate connect ignored");
                return true;
            }
            registry
                .open_session(session_id, sink.clone(), &connect)
                .map(|_| ())
        }
        ClientMessage::Data(data) => registry.route_data(session_id, &data),
        ClientMessage::Resize(size) => registry.resize(session_id, size.rows, size.cols),
        ClientMessage::Suspend { token } => {
            registry.suspend(session_id, &token);
            Ok(())
        }
        ClientMessage::Disconnect { token } => registry.disconnect(session_id, &token).await,
    };

    match outcome {
        Ok(()) => true,
        Err(e) => {
            warn!(session_id, error = %e, "client request failed");
            fail(registry, session_id, sink, &e.to_string()).await
        }
    }
}

/// Report `reason` on the socket and close it along with its session.
async fn fail(
    registry: &SessionRegistry,
    session_id: &str,
    sink: &ClientSink,
    reason: &str,
) -> bool {
    sink.notice(reason);
    registry.socket_closed(session_id).await;
    sink.close();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::transport::SinkCommand;
    use webterm_core::ServerMessage;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(RegistryConfig::default())
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<SinkCommand>) -> Vec<SinkCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[tokio::test]
    async fn malformed_message_closes_socket() {
        let reg = registry();
        let (sink, mut rx) = ClientSink::channel();
        assert!(!dispatch(&reg, "s", &sink, "not json").await);
        let frames = drain(&mut rx);
        assert!(matches!(frames.first(), Some(SinkCommand::Frame(ServerMessage::Output(_)))));
        assert_eq!(frames.last(), Some(&SinkCommand::Close));
    }

    #[tokio::test]
    async fn unsupported_type_is_reported() {
        let reg = registry();
        let (sink, mut rx) = ClientSink::channel();
        assert!(!dispatch(&reg, "s", &sink, r#"{"t":"bogus","p":""}"#).await);
        let frames = drain(&mut rx);
        assert_eq!(
            frames[0],
            SinkCommand::Frame(ServerMessage::notice("Unsupported Message: bogus"))
        );
    }

    #[tokio::test]
    async fn unknown_token_and_session() {
        let reg = registry();
        let (sink, mut rx) = ClientSink::channel();
        let connect = r#"{"t":"connect","p":"{\"token\":\"nope\",\"rows\":24,\"cols\":80}"}"#;
        assert!(!dispatch(&reg, "s", &sink, connect).await);
        assert_eq!(
            drain(&mut rx)[0],
            SinkCommand::Frame(ServerMessage::notice("Session Token Not Found"))
        );

        let (sink, mut rx) = ClientSink::channel();
        assert!(!dispatch(&reg, "s", &sink, r#"{"t":"d","p":"ls"}"#).await);
        assert_eq!(
            drain(&mut rx)[0],
            SinkCommand::Frame(ServerMessage::notice("Unknown Session for Data"))
        );
    }

    #[tokio::test]
    async fn suspend_for_unknown_token_keeps_socket() {
        let reg = registry();
        let (sink, mut rx) = ClientSink::channel();
        assert!(dispatch(&reg, "s", &sink, r#"{"t":"suspend","p":"tok"}"#).await);
        assert!(drain(&mut rx).is_empty());
    }
}
