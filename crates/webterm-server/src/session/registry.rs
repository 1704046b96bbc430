//! Session registry: the live table of connections keyed by session id, the
//! pending token table, and every operation that crosses more than one
//! session (fan-out, cascading close, suspend, sweeps).
//!
//! Locking: the table is only used to look connections up. Callers snapshot
//! the `Arc`s they need and release the map before touching a connection's
//! own locks. Within a connection the order is replay → info and
//! replay → sink.

use super::{AuditLog, SessionInfo, SessionSummary};
use crate::config::RegistryConfig;
use crate::connection::io::{BackendIo, OutputStream};
use crate::connection::join::JoinProxy;
use crate::connection::{BackendKind, Connection};
use crate::handshake::{self, PendingView, TokenTable, INVALID_REQUEST};
use crate::transport::{ClientSink, Offer};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use webterm_core::{
    AuditLogging, GatewayError, GatewayResult, RowsCols, ServerMessage, TokenRequest,
    TokenResponse, TokenRowsCols, Utf8Carry, ROLE_ADMIN,
};

pub const CONNECTION_READY: &str = "Connection ready";
pub const SERVER_CLOSED: &str = "Server Closed Connection";
pub const PARENT_CLOSED: &str = "Disconnecting(Parent Session Closed)";
pub const PARENT_SUSPENDED: &str = "Disconnecting(Parent Session Suspended)";
pub const SESSION_SUSPENDED: &str = "Session Suspended";
pub const SESSION_DISCONNECTING: &str = "Session Disconnecting";
pub const TIMED_OUT: &str = "Session Timed Out Administratively";
pub const TERMINATED: &str = "Session Terminated Administratively";
pub const UNKNOWN_FOR_DATA: &str = "Unknown Session for Data";
pub const UNKNOWN_FOR_RESIZE: &str = "Unknown Session for Resize";
pub const UNKNOWN_FOR_DISCONNECT: &str = "Unknown Session for Disconnect";

/// Parent chains are one level deep in practice; the bound only guards
/// against a corrupted table.
const MAX_PARENT_HOPS: usize = 8;

/// `{"status": ...}` reply of the administrative drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropStatus {
    pub status: String,
}

/// Shared handle to all live sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Connection>>>,
    tokens: Arc<TokenTable>,
    config: Arc<RegistryConfig>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            tokens: Arc::new(TokenTable::new(config.token_ttl)),
            config: Arc::new(config),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Connection>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub(crate) fn insert(&self, conn: Arc<Connection>) {
        self.sessions.insert(conn.session_id(), conn);
    }

    /// Remove `session_id` only if it still maps to `conn`.
    fn remove_entry(&self, session_id: &str, conn: &Arc<Connection>) {
        self.sessions
            .remove_if(session_id, |_, v| Arc::ptr_eq(v, conn));
    }

    /// Re-key a root after a takeover.
    pub(crate) fn rebind(&self, old_id: &str, new_id: &str, root: &Arc<Connection>) {
        self.sessions.insert(new_id.to_string(), Arc::clone(root));
        self.remove_entry(old_id, root);
    }

    // ---- tokens ----------------------------------------------------------

    /// Phase one of the handshake.
    pub fn issue_token(&self, request: TokenRequest) -> TokenResponse {
        let request = match handshake::prepare(request) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "token request rejected");
                return TokenResponse::failure(INVALID_REQUEST);
            }
        };
        let root = request
            .parent_token
            .as_deref()
            .and_then(|t| self.root_by_token(t))
            .map(|r| r.info_snapshot());
        if let Err(e) = handshake::authorize(&request, root.as_ref()) {
            warn!(user = %request.web_user_name, error = %e, "token request not authorized");
            return TokenResponse::failure(INVALID_REQUEST);
        }
        TokenResponse::success(self.tokens.insert(request, Instant::now()))
    }

    pub fn pending_tokens(&self) -> Vec<PendingView> {
        self.tokens.pending()
    }

    pub fn sweep_tokens(&self, now: Instant) -> usize {
        self.tokens.sweep(now)
    }

    // ---- lookup ----------------------------------------------------------

    pub fn find_by_token(&self, token: &str) -> Option<Arc<Connection>> {
        self.snapshot().into_iter().find(|c| c.token() == token)
    }

    /// Follow parent tokens up to the root session.
    pub fn root_by_token(&self, token: &str) -> Option<Arc<Connection>> {
        let mut conn = self.find_by_token(token)?;
        for _ in 0..MAX_PARENT_HOPS {
            if conn.is_root() {
                return Some(conn);
            }
            let parent = conn.with_info(|i| i.parent_token.clone())?;
            conn = self.find_by_token(&parent)?;
        }
        None
    }

    // ---- connect ---------------------------------------------------------

    /// Redeem the token from a `connect` message and start the session bound
    /// to `sink`.
    pub fn open_session(
        &self,
        session_id: &str,
        sink: ClientSink,
        connect: &TokenRowsCols,
    ) -> GatewayResult<Arc<Connection>> {
        let request = self.tokens.redeem(&connect.token)?;
        let mut info = SessionInfo::from_request(
            session_id.to_string(),
            connect.token.clone(),
            request,
            connect.rows,
            connect.cols,
        );

        let conn = if info.is_root() {
            let kind = BackendKind::for_root(&info)?;
            let audit = (info.audit_logging == AuditLogging::On)
                .then(|| AuditLog::for_session(&self.config.audit_log_dir, &info));
            let budget = self.config.replay_budget(info.connection_type);
            Connection::new(info, Some(sink), kind, budget, audit)
        } else {
            let root = info
                .parent_token
                .as_deref()
                .and_then(|t| self.root_by_token(t));
            if let Some(r) = &root {
                info.font_size = r.with_info(|ri| ri.font_size);
            }
            let proxy = JoinProxy::new(root.as_ref());
            Connection::new(info, Some(sink), BackendKind::Join(proxy), 0, None)
        };

        self.insert(Arc::clone(&conn));
        info!(
            session_id,
            kind = conn.kind().label(),
            session_type = %conn.session_type(),
            "session opened"
        );

        let registry = self.clone();
        let spawned = Arc::clone(&conn);
        let is_join = matches!(conn.kind(), BackendKind::Join(_));
        tokio::spawn(async move {
            if is_join {
                registry.connect_join(spawned).await
            } else {
                registry.connect_root(spawned).await
            }
        });
        Ok(conn)
    }

    async fn connect_root(&self, conn: Arc<Connection>) {
        match conn.dial(&self.config.backend).await {
            Ok(io) => self.serve_backend(conn, io).await,
            Err(e) => {
                error!(session_id = %conn.session_id(), error = %e, "backend connect failed");
                conn.notice(&e.to_string());
                self.close(&conn).await;
            }
        }
    }

    /// Bind a running backend to `conn` and pump its output until either side
    /// ends.
    pub(crate) async fn serve_backend(&self, conn: Arc<Connection>, io: BackendIo) {
        let BackendIo { output, input } = io;
        conn.install_backend(input);
        conn.update_info(|i| {
            i.wipe_password();
            i.ready = true;
        });
        conn.notice(CONNECTION_READY);
        info!(session_id = %conn.session_id(), "connection ready");

        self.pump(&conn, output).await;

        if !conn.is_closed() {
            self.broadcast_notice(&conn, SERVER_CLOSED);
            self.close(&conn).await;
        }
    }

    async fn pump(&self, conn: &Arc<Connection>, mut output: OutputStream) {
        let cancel = conn.cancel_token();
        let mut utf8 = Utf8Carry::default();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = output.next_chunk() => chunk,
            };
            let Some(chunk) = chunk else {
                debug!(session_id = %conn.session_id(), "backend output ended");
                break;
            };
            let text = utf8.decode(&chunk);
            if text.is_empty() {
                continue;
            }
            self.deliver(conn, &text).await;
            conn.audit(&text).await;
        }
    }

    /// Append to the backlog and fan out to the owner and every child.
    ///
    /// A child whose socket is backed up is closed. A backed-up owner holds
    /// the pump until its socket has room, which in turn stalls the backend.
    async fn deliver(&self, root: &Arc<Connection>, text: &str) {
        let (backed_up, lagging) = {
            let mut replay = root.replay();
            replay.push(text);
            root.update_info(|i| i.touch(Instant::now()));
            let backed_up = match root.offer_frame(ServerMessage::Output(text.to_string())) {
                Offer::Full(msg) => root.sink().map(|s| (s, msg)),
                Offer::Queued | Offer::Gone => None,
            };
            let lagging: Vec<_> = self
                .resolve_children(root)
                .into_iter()
                .filter(|child| {
                    matches!(
                        child.offer_frame(ServerMessage::Output(text.to_string())),
                        Offer::Full(_)
                    )
                })
                .collect();
            (backed_up, lagging)
        };

        for child in lagging {
            warn!(session_id = %child.session_id(), "attached socket backed up, closing");
            self.close(&child).await;
        }
        if let Some((sink, msg)) = backed_up {
            debug!(session_id = %root.session_id(), "owner socket backed up, waiting");
            if !sink.send_wait(msg).await {
                debug!(session_id = %root.session_id(), "owner socket gone while waiting");
            }
        }
    }

    fn resolve_children(&self, root: &Connection) -> Vec<Arc<Connection>> {
        root.children()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Notice to the owner and all children.
    fn broadcast_notice(&self, root: &Arc<Connection>, text: &str) {
        root.notice(text);
        for child in self.resolve_children(root) {
            child.notice(text);
        }
    }

    // ---- client messages -------------------------------------------------

    /// Forward keystrokes. Input before the session is ready is dropped.
    pub fn route_data(&self, session_id: &str, data: &str) -> GatewayResult<()> {
        let conn = self
            .get(session_id)
            .ok_or_else(|| GatewayError::NotFound(UNKNOWN_FOR_DATA.into()))?;
        if !conn.with_info(|i| i.ready) {
            debug!(session_id, "user input ignored while session not ready");
            return Ok(());
        }
        conn.send(data)
    }

    /// Resize a root's backend and tell children the new geometry. Child
    /// resizes are ignored.
    pub fn resize(&self, session_id: &str, rows: u16, cols: u16) -> GatewayResult<()> {
        let conn = self
            .get(session_id)
            .ok_or_else(|| GatewayError::NotFound(UNKNOWN_FOR_RESIZE.into()))?;
        if !conn.is_root() {
            debug!(session_id, "resize ignored for attached session");
            return Ok(());
        }
        self.resize_root(&conn, rows, cols);
        Ok(())
    }

    pub(crate) fn resize_root(&self, root: &Arc<Connection>, rows: u16, cols: u16) {
        match root.resize_backend(rows, cols) {
            Ok(true) => {
                for child in self.resolve_children(root) {
                    child.send_frame(ServerMessage::Geometry(RowsCols { rows, cols }));
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "backend resize failed"),
        }
    }

    /// Detach the browser from its root while keeping the backend running.
    /// Only the owner of a NEW session may suspend it.
    pub fn suspend(&self, session_id: &str, token: &str) -> bool {
        let Some(root) = self.root_by_token(token) else {
            debug!(session_id, "suspend for unknown token");
            return false;
        };
        let allowed = root.with_info(|i| i.session_id == session_id && i.is_root());
        if !allowed {
            warn!(session_id, "suspend not allowed");
            return false;
        }

        for id in root.take_children() {
            if let Some(child) = self.get(&id) {
                child.notice(PARENT_SUSPENDED);
                child.mark_closed();
                child.close_sink();
                self.remove_entry(&id, &child);
            }
        }
        root.update_info(|i| {
            i.suspended = true;
            i.max_idle_time = 0;
        });
        root.notice(SESSION_SUSPENDED);
        root.close_sink();
        info!(session_id, "session suspended");
        true
    }

    /// Close the caller's own session at its request.
    pub async fn disconnect(&self, session_id: &str, token: &str) -> GatewayResult<()> {
        match self.find_by_token(token) {
            Some(conn) if conn.session_id() == session_id => {
                self.broadcast_notice(&conn, SESSION_DISCONNECTING);
                self.close(&conn).await;
                Ok(())
            }
            _ => Err(GatewayError::NotFound(UNKNOWN_FOR_DISCONNECT.into())),
        }
    }

    /// The browser socket behind `session_id` went away. Suspended roots
    /// survive; everything else is closed.
    pub async fn socket_closed(&self, session_id: &str) {
        let Some(conn) = self.get(session_id) else {
            return;
        };
        if conn.is_suspended() {
            debug!(session_id, "socket closed on suspended session");
            return;
        }
        self.close(&conn).await;
    }

    // ---- close -----------------------------------------------------------

    /// Close a session. Idempotent; returns whether this call did the work.
    /// A root takes its children down first.
    pub async fn close(&self, conn: &Arc<Connection>) -> bool {
        if !conn.mark_closed() {
            return false;
        }
        let session_id = conn.session_id();

        if let BackendKind::Join(_) = conn.kind() {
            self.remove_entry(&session_id, conn);
            conn.close_sink();
            if let Some(root) = conn.join_root() {
                if root.remove_child(&session_id) {
                    self.update_participants(&root);
                }
            }
            info!(session_id = %session_id, "attached session closed");
            return true;
        }

        for id in conn.take_children() {
            if let Some(child) = self.get(&id) {
                self.remove_entry(&id, &child);
                if child.mark_closed() {
                    child.notice(PARENT_CLOSED);
                    child.close_sink();
                }
            }
        }
        self.remove_entry(&session_id, conn);
        conn.close_backend();
        conn.close_sink();
        conn.close_audit().await;
        info!(session_id = %session_id, "session closed");
        true
    }

    /// `JOINED: owner +child ...` to the owner and every child.
    pub(crate) fn update_participants(&self, root: &Arc<Connection>) {
        let children = self.resolve_children(root);
        let mut line = format!("JOINED: {}", root.with_info(|i| i.web_user_name.clone()));
        for child in &children {
            line.push_str(" +");
            line.push_str(&child.with_info(|i| i.web_user_name.clone()));
        }
        root.send_frame(ServerMessage::Participants(line.clone()));
        for child in &children {
            child.send_frame(ServerMessage::Participants(line.clone()));
        }
    }

    // ---- housekeeping ----------------------------------------------------

    /// Close roots idle past their threshold. Returns how many were closed.
    pub async fn sweep_idle(&self, now: Instant) -> usize {
        let expired: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|c| {
                !c.is_closed()
                    && c.with_info(|i| i.is_root() && i.idle_expired(now))
            })
            .collect();

        let mut closed = 0;
        for conn in expired {
            info!(session_id = %conn.session_id(), "session idle timeout");
            self.broadcast_notice(&conn, TIMED_OUT);
            if self.close(&conn).await {
                closed += 1;
            }
        }
        closed
    }

    /// Sessions `user` may see; `None` lists everything. Only sessions whose
    /// credentials are already wiped are shown.
    pub fn visible_sessions(&self, user: Option<&str>) -> Vec<SessionSummary> {
        let user = user.filter(|u| !u.is_empty());
        self.snapshot()
            .into_iter()
            .filter(|c| !c.is_closed())
            .filter_map(|c| {
                c.with_info(|i| (i.password_wiped() && i.visible_to(user)).then(|| i.summary()))
            })
            .collect()
    }

    /// Administrative kill. Allowed for ADMIN or the owner of the root.
    pub async fn drop_session(&self, token: &str, user: &str, role: &str) -> DropStatus {
        let allowed = role == ROLE_ADMIN
            || self
                .root_by_token(token)
                .map(|r| r.with_info(|i| i.web_user_name == user))
                .unwrap_or(false);
        if !allowed {
            warn!(token, user, "drop not allowed");
            return DropStatus {
                status: format!("FAILURE: KILL {token} NOT ALLOWED"),
            };
        }
        match self.find_by_token(token) {
            Some(conn) => {
                self.broadcast_notice(&conn, TERMINATED);
                self.close(&conn).await;
                info!(token, user, "session dropped");
                DropStatus {
                    status: format!("SUCCESS: {token} REMOVED"),
                }
            }
            None => DropStatus {
                status: format!("FAILURE: {token} NOT FOUND"),
            },
        }
    }

    /// Shutdown: close every root (children go with them).
    pub async fn close_all(&self) {
        let roots: Vec<_> = self.snapshot().into_iter().filter(|c| c.is_root()).collect();
        for conn in roots {
            self.broadcast_notice(&conn, SERVER_CLOSED);
            self.close(&conn).await;
        }
        for conn in self.snapshot() {
            self.close(&conn).await;
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("pending_tokens", &self.tokens.len())
            .finish()
    }
}
