//! A browser-bound session and the backend it drives.
//!
//! Root connections own a PTY, SSH or Telnet backend. Join connections proxy
//! to a root through a weak reference and never own a backend themselves.

pub mod io;
pub mod join;
pub mod pty;
pub mod ssh;
pub mod telnet;

use crate::config::BackendConfig;
use crate::session::{AuditLog, ReplayBuffer, SessionInfo};
use crate::transport::{ClientSink, Offer};
use io::{BackendIo, InputSender};
use join::JoinProxy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webterm_core::{ConnectionType, GatewayError, GatewayResult, ServerMessage, SessionType};

/// Everything a backend needs to dial. Built once, at connect time, which is
/// also when the session's stored password is masked.
#[derive(Clone)]
pub struct DialTarget {
    pub connection_type: ConnectionType,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub rows: u16,
    pub cols: u16,
}

impl DialTarget {
    fn take_from(info: &mut SessionInfo) -> GatewayResult<Self> {
        let connection_type = info
            .connection_type
            .ok_or_else(|| GatewayError::Config("missing connectionType".into()))?;
        let host = info
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| GatewayError::Config("missing host".into()))?;
        Ok(Self {
            connection_type,
            host,
            port: info.port.unwrap_or_else(|| connection_type.default_port()),
            username: info.username.clone(),
            password: info.take_password(),
            rows: info.rows,
            cols: info.cols,
        })
    }
}

/// Which backend a connection drives.
pub enum BackendKind {
    Pty,
    Ssh,
    Telnet,
    Join(JoinProxy),
}

impl BackendKind {
    /// Pick the backend for a root session.
    pub fn for_root(info: &SessionInfo) -> GatewayResult<Self> {
        match (info.use_pty, info.connection_type) {
            (true, _) | (_, Some(ConnectionType::Tn3270)) => Ok(BackendKind::Pty),
            (false, Some(ConnectionType::Ssh)) => Ok(BackendKind::Ssh),
            (false, Some(ConnectionType::Telnet)) => Ok(BackendKind::Telnet),
            (false, None) => Err(GatewayError::Config("Unknown ConnectionType".into())),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Pty => "pty",
            BackendKind::Ssh => "ssh",
            BackendKind::Telnet => "telnet",
            BackendKind::Join(_) => "join",
        }
    }
}

/// One logical terminal session bound to (at most) one browser socket.
pub struct Connection {
    info: Mutex<SessionInfo>,
    sink: Mutex<Option<ClientSink>>,
    kind: BackendKind,
    backend: Mutex<Option<InputSender>>,
    replay: Mutex<ReplayBuffer>,
    audit: tokio::sync::Mutex<Option<AuditLog>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(
        info: SessionInfo,
        sink: Option<ClientSink>,
        kind: BackendKind,
        replay_budget: usize,
        audit: Option<AuditLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(info),
            sink: Mutex::new(sink),
            kind,
            backend: Mutex::new(None),
            replay: Mutex::new(ReplayBuffer::new(replay_budget)),
            audit: tokio::sync::Mutex::new(audit),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> &BackendKind {
        &self.kind
    }

    pub fn session_id(&self) -> String {
        self.info.lock().session_id.clone()
    }

    pub fn token(&self) -> String {
        self.info.lock().token.clone()
    }

    pub fn session_type(&self) -> SessionType {
        self.info.lock().session_type
    }

    pub fn is_root(&self) -> bool {
        self.info.lock().is_root()
    }

    /// Read the session record under its lock.
    pub fn with_info<R>(&self, f: impl FnOnce(&SessionInfo) -> R) -> R {
        f(&self.info.lock())
    }

    /// Mutate the session record under its lock.
    pub fn update_info<R>(&self, f: impl FnOnce(&mut SessionInfo) -> R) -> R {
        f(&mut self.info.lock())
    }

    pub fn info_snapshot(&self) -> SessionInfo {
        self.info.lock().clone()
    }

    /// Root connection for a JOIN/WATCH/TAKE session, if still around.
    pub fn join_root(&self) -> Option<Arc<Connection>> {
        match &self.kind {
            BackendKind::Join(proxy) => proxy.root(),
            _ => None,
        }
    }

    // ---- browser side ----------------------------------------------------

    /// Install a new socket, returning the previous one.
    pub fn replace_sink(&self, sink: Option<ClientSink>) -> Option<ClientSink> {
        std::mem::replace(&mut *self.sink.lock(), sink)
    }

    /// Queue a frame on this session's own socket (no fan-out).
    pub fn send_frame(&self, msg: ServerMessage) -> bool {
        match self.sink.lock().as_ref() {
            Some(s) => s.send(msg),
            None => false,
        }
    }

    /// Queue a frame without waiting and report whether the socket had room.
    pub fn offer_frame(&self, msg: ServerMessage) -> Offer {
        match self.sink.lock().as_ref() {
            Some(s) => s.offer(msg),
            None => Offer::Gone,
        }
    }

    /// The current socket, for callers that must wait on it outside the
    /// session's locks.
    pub fn sink(&self) -> Option<ClientSink> {
        self.sink.lock().clone()
    }

    /// Queue a CR/LF wrapped notice on this session's own socket.
    pub fn notice(&self, text: &str) -> bool {
        self.send_frame(ServerMessage::notice(text))
    }

    /// Close and forget the browser socket; queued frames still flush.
    pub fn close_sink(&self) {
        if let Some(s) = self.sink.lock().take() {
            s.close();
        }
    }

    // ---- backend side ----------------------------------------------------

    /// Dial the backend for a root session, then run any auto-login.
    pub async fn dial(&self, cfg: &BackendConfig) -> GatewayResult<BackendIo> {
        let target = self.update_info(DialTarget::take_from)?;
        debug!(
            kind = self.kind.label(),
            host = %target.host,
            port = target.port,
            "dialing backend"
        );
        match &self.kind {
            BackendKind::Pty => {
                let mut io = pty::spawn(cfg, &target)?;
                if target.connection_type != ConnectionType::Tn3270 {
                    pty::auto_login(&mut io, &target, cfg.prompt_timeout).await?;
                }
                Ok(io)
            }
            BackendKind::Ssh => ssh::connect(cfg, &target).await,
            BackendKind::Telnet => {
                let mut io = telnet::connect(cfg, &target).await?;
                telnet::auto_login(&mut io, &target, cfg.prompt_timeout).await?;
                Ok(io)
            }
            BackendKind::Join(_) => Err(GatewayError::NoBackend),
        }
    }

    /// Attach the backend's input side.
    pub fn install_backend(&self, input: InputSender) {
        *self.backend.lock() = Some(input);
    }

    /// Forward client input. WATCH sessions are input-silent.
    pub fn send(&self, data: &str) -> GatewayResult<()> {
        match &self.kind {
            BackendKind::Join(proxy) => {
                if self.session_type() != SessionType::Join {
                    debug!("user input ignored when session is WATCH only");
                    return Ok(());
                }
                proxy.root().ok_or(GatewayError::NoBackend)?.send(data)
            }
            _ => {
                let input = self.backend.lock().clone().ok_or(GatewayError::NoBackend)?;
                if !input.is_alive() {
                    return Err(GatewayError::NoBackend);
                }
                input.send_data(data.as_bytes())?;
                self.update_info(|i| i.touch(Instant::now()));
                Ok(())
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match &self.kind {
            BackendKind::Join(proxy) => proxy.root().map(|r| r.is_alive()).unwrap_or(false),
            _ => self
                .backend
                .lock()
                .as_ref()
                .map(InputSender::is_alive)
                .unwrap_or(false),
        }
    }

    /// Apply new geometry to the backend. Returns whether it changed.
    pub fn resize_backend(&self, rows: u16, cols: u16) -> GatewayResult<bool> {
        let changed = self.update_info(|i| {
            if i.rows == rows && i.cols == cols {
                false
            } else {
                i.rows = rows;
                i.cols = cols;
                true
            }
        });
        if changed {
            if let Some(input) = self.backend.lock().as_ref() {
                input.resize(rows, cols)?;
            }
            debug!(rows, cols, "backend resized");
        }
        Ok(changed)
    }

    /// Stop the backend; a no-op when there is none.
    pub fn close_backend(&self) {
        self.cancel.cancel();
        if let Some(input) = self.backend.lock().take() {
            input.close();
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ---- lifecycle -------------------------------------------------------

    /// Flip to closed. Returns false if it already was.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.info.lock().suspended
    }

    // ---- replay and audit ------------------------------------------------

    /// Lock the replay buffer. Held while fanning out so attach and live
    /// output never interleave.
    pub fn replay(&self) -> parking_lot::MutexGuard<'_, ReplayBuffer> {
        self.replay.lock()
    }

    pub async fn audit(&self, text: &str) {
        if let Some(log) = self.audit.lock().await.as_mut() {
            log.append(text).await;
        }
    }

    pub async fn close_audit(&self) {
        if let Some(log) = self.audit.lock().await.as_mut() {
            log.close().await;
        }
    }

    // ---- children --------------------------------------------------------

    pub fn children(&self) -> Vec<String> {
        self.info.lock().children.clone()
    }

    pub fn add_child(&self, session_id: &str) {
        let mut info = self.info.lock();
        if !info.children.iter().any(|c| c == session_id) {
            info.children.push(session_id.to_string());
        }
    }

    pub fn remove_child(&self, session_id: &str) -> bool {
        let mut info = self.info.lock();
        let before = info.children.len();
        info.children.retain(|c| c != session_id);
        info.children.len() != before
    }

    pub fn take_children(&self) -> Vec<String> {
        std::mem::take(&mut self.info.lock().children)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind.label())
            .field("info", &*self.info.lock())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SinkCommand;
    use io::{BackendCommand, BackendIo};
    use webterm_core::{TokenRequest, PASSWORD_MASK};

    fn root() -> Arc<Connection> {
        let req = TokenRequest {
            host: Some("h".into()),
            connection_type: Some(ConnectionType::Ssh),
            username: Some("u".into()),
            password: Some("p".into()),
            ..Default::default()
        };
        let info = SessionInfo::from_request("sid".into(), "tok".into(), req, 24, 80);
        let kind = BackendKind::for_root(&info).unwrap();
        Connection::new(info, None, kind, 64, None)
    }

    #[test]
    fn backend_selection() {
        let conn = root();
        assert_eq!(conn.kind().label(), "ssh");

        let mut info = conn.info_snapshot();
        info.connection_type = Some(ConnectionType::Tn3270);
        assert_eq!(BackendKind::for_root(&info).unwrap().label(), "pty");

        info.connection_type = Some(ConnectionType::Telnet);
        assert_eq!(BackendKind::for_root(&info).unwrap().label(), "telnet");
        info.use_pty = true;
        assert_eq!(BackendKind::for_root(&info).unwrap().label(), "pty");
    }

    #[test]
    fn dial_target_masks_password() {
        let conn = root();
        let target = conn.update_info(DialTarget::take_from).unwrap();
        assert_eq!(target.password.as_deref(), Some("p"));
        assert_eq!(target.port, 22);
        assert!(conn.with_info(|i| i.password_wiped()));
        let again = conn.update_info(DialTarget::take_from).unwrap();
        assert_eq!(again.password.as_deref(), Some(PASSWORD_MASK));
    }

    #[tokio::test]
    async fn send_without_backend_fails() {
        let conn = root();
        assert!(matches!(conn.send("x"), Err(GatewayError::NoBackend)));
        assert!(!conn.is_alive());

        let (io, mut peer) = BackendIo::pair();
        conn.install_backend(io.input);
        assert!(conn.is_alive());
        conn.send("ls\n").unwrap();
        assert_eq!(
            peer.commands.recv().await,
            Some(BackendCommand::Data(b"ls\n".to_vec()))
        );
    }

    #[tokio::test]
    async fn resize_only_when_different() {
        let conn = root();
        let (io, mut peer) = BackendIo::pair();
        conn.install_backend(io.input);

        assert!(!conn.resize_backend(24, 80).unwrap());
        assert!(conn.resize_backend(30, 100).unwrap());
        assert_eq!(
            peer.commands.recv().await,
            Some(BackendCommand::Resize { rows: 30, cols: 100 })
        );
        assert_eq!(conn.with_info(|i| (i.rows, i.cols)), (30, 100));
    }

    #[tokio::test]
    async fn sink_swap_and_close() {
        let conn = root();
        let (a, mut ra) = ClientSink::channel();
        let (b, _rb) = ClientSink::channel();
        assert!(conn.replace_sink(Some(a)).is_none());
        let old = conn.replace_sink(Some(b)).unwrap();
        assert!(old.notice("bye"));
        old.close();
        assert!(matches!(ra.recv().await, Some(SinkCommand::Frame(_))));
        assert_eq!(ra.recv().await, Some(SinkCommand::Close));

        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
    }

    #[test]
    fn children_are_ordered_sets() {
        let conn = root();
        conn.add_child("a");
        conn.add_child("b");
        conn.add_child("a");
        assert_eq!(conn.children(), vec!["a", "b"]);
        assert!(conn.remove_child("a"));
        assert!(!conn.remove_child("a"));
        assert_eq!(conn.take_children(), vec!["b"]);
        assert!(conn.children().is_empty());
    }
}
