//! Per-session record: identity, backend target, browser context, lifecycle
//! flags and the ordered list of attached children.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use webterm_core::{
    AuditLogging, ConnectionType, SessionType, TokenRequest, DEFAULT_FONT_SIZE, PASSWORD_MASK,
};

/// Mutable description of one logical terminal session.
///
/// Always accessed through the owning connection's lock; the children list is
/// therefore guarded per session rather than by any table-wide lock.
#[derive(Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub token: String,
    pub parent_token: Option<String>,
    pub session_type: SessionType,
    pub connection_type: Option<ConnectionType>,
    pub use_pty: bool,

    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    password: Option<String>,

    pub web_user_name: String,
    pub web_user_role: String,
    pub web_user_ip: String,
    pub description: Option<String>,
    pub font_size: u32,
    pub rows: u16,
    pub cols: u16,
    pub in_time: String,

    pub ready: bool,
    pub suspended: bool,
    pub visible_to_all: bool,
    /// Minutes; 0 disables the idle sweep.
    pub max_idle_time: u32,
    pub last_traffic: Option<Instant>,
    pub audit_logging: AuditLogging,

    /// Session ids of attached JOIN/WATCH children, in attach order.
    pub children: Vec<String>,
}

impl SessionInfo {
    /// Build the record for a freshly redeemed token.
    pub fn from_request(
        session_id: String,
        token: String,
        req: TokenRequest,
        rows: u16,
        cols: u16,
    ) -> Self {
        let session_type = req.session_type();
        Self {
            session_id,
            token,
            parent_token: req.parent_token,
            session_type,
            connection_type: req.connection_type,
            use_pty: req.use_pty,
            host: req.host,
            port: req.port,
            username: req.username,
            password: req.password,
            web_user_name: req.web_user_name,
            web_user_role: req.web_user_role,
            web_user_ip: req.web_user_ip,
            description: req.description,
            font_size: req.font_size.unwrap_or(DEFAULT_FONT_SIZE),
            rows,
            cols,
            in_time: req.in_time.unwrap_or_default(),
            ready: false,
            suspended: false,
            visible_to_all: req.visible_to_all,
            max_idle_time: req.max_idle_time,
            last_traffic: None,
            audit_logging: req.audit_logging,
            children: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.session_type == SessionType::New
    }

    /// Hand out the password once, leaving the mask behind.
    pub fn take_password(&mut self) -> Option<String> {
        let pw = self.password.take();
        if pw.is_some() {
            self.password = Some(PASSWORD_MASK.to_string());
        }
        pw
    }

    /// Forget the password without using it.
    pub fn wipe_password(&mut self) {
        self.take_password();
    }

    /// True once credentials are gone (or never existed).
    pub fn password_wiped(&self) -> bool {
        match self.password.as_deref() {
            None => true,
            Some(p) => p == PASSWORD_MASK,
        }
    }

    /// Record traffic; ignored until the backend is usable.
    pub fn touch(&mut self, now: Instant) {
        if self.ready {
            self.last_traffic = Some(now);
        }
    }

    /// Whether the idle threshold has elapsed at `now`.
    pub fn idle_expired(&self, now: Instant) -> bool {
        if self.max_idle_time == 0 {
            return false;
        }
        match self.last_traffic {
            Some(last) => {
                now.saturating_duration_since(last)
                    >= Duration::from_secs(u64::from(self.max_idle_time) * 60)
            }
            None => false,
        }
    }

    /// Copy the backend target of `root` for display on a child.
    pub fn inherit_target(&mut self, root: &SessionInfo) {
        self.host = root.host.clone();
        self.port = root.port;
        self.connection_type = root.connection_type;
        self.use_pty = root.use_pty;
    }

    /// Whether `user` may see this session in listings.
    pub fn visible_to(&self, user: Option<&str>) -> bool {
        match user {
            None => true,
            Some(u) => self.visible_to_all || self.web_user_name == u,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            token: self.token.clone(),
            parent_token: self.parent_token.clone(),
            session_type: self.session_type,
            connection_type: self.connection_type,
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            description: self.description.clone(),
            web_user_name: self.web_user_name.clone(),
            web_user_ip: self.web_user_ip.clone(),
            in_time: self.in_time.clone(),
            rows: self.rows,
            cols: self.cols,
            suspended: self.suspended,
            visible_to_all: self.visible_to_all,
            max_idle_time: self.max_idle_time,
            idle_secs: self.last_traffic.map(|t| t.elapsed().as_secs()),
            children: self.children.len(),
        }
    }
}

impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInfo")
            .field("session_id", &self.session_id)
            .field("session_type", &self.session_type)
            .field("connection_type", &self.connection_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| PASSWORD_MASK))
            .field("web_user_name", &self.web_user_name)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("ready", &self.ready)
            .field("suspended", &self.suspended)
            .field("children", &self.children)
            .finish()
    }
}

/// Listing row returned to the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub token: String,
    pub parent_token: Option<String>,
    pub session_type: SessionType,
    pub connection_type: Option<ConnectionType>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub description: Option<String>,
    pub web_user_name: String,
    pub web_user_ip: String,
    pub in_time: String,
    pub rows: u16,
    pub cols: u16,
    pub suspended: bool,
    pub visible_to_all: bool,
    pub max_idle_time: u32,
    pub idle_secs: Option<u64>,
    pub children: usize,
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
