//! Handshake request/response types shared with the external HTTP layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role that bypasses all ownership checks.
pub const ROLE_ADMIN: &str = "ROLE_ADMIN";

/// Default browser font size when the request does not carry one.
pub const DEFAULT_FONT_SIZE: u32 = 15;

/// Replacement written over credentials once they have been used.
pub const PASSWORD_MASK: &str = "*";

/// How a session relates to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SessionType {
    /// Owns a real backend (root session).
    New,
    /// Attached child that may type into the root.
    Join,
    /// Attached child that only observes.
    Watch,
    /// Takes control of the root away from its current browser.
    Take,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::New => "NEW",
            SessionType::Join => "JOIN",
            SessionType::Watch => "WATCH",
            SessionType::Take => "TAKE",
        }
    }
}

impl FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(SessionType::New),
            "JOIN" => Ok(SessionType::Join),
            "WATCH" => Ok(SessionType::Watch),
            "TAKE" => Ok(SessionType::Take),
            other => Err(format!("unknown session type: {other}")),
        }
    }
}

impl TryFrom<String> for SessionType {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SessionType> for String {
    fn from(t: SessionType) -> String {
        t.as_str().to_string()
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConnectionType {
    Ssh,
    Telnet,
    Tn3270,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Ssh => "ssh",
            ConnectionType::Telnet => "telnet",
            ConnectionType::Tn3270 => "tn3270",
        }
    }

    /// Well-known port used when the request leaves it out.
    pub fn default_port(&self) -> u16 {
        match self {
            ConnectionType::Ssh => 22,
            _ => 23,
        }
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(ConnectionType::Ssh),
            "telnet" => Ok(ConnectionType::Telnet),
            "tn3270" => Ok(ConnectionType::Tn3270),
            other => Err(format!("Unknown ConnectionType: {other}")),
        }
    }
}

impl TryFrom<String> for ConnectionType {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ConnectionType> for String {
    fn from(t: ConnectionType) -> String {
        t.as_str().to_string()
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether backend output is also written to a persistent audit file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLogging {
    On,
    #[default]
    Off,
}

/// A validated request for a session, handed over by the HTTP layer.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    #[serde(default)]
    pub session_type: Option<SessionType>,
    #[serde(default)]
    pub parent_token: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub connection_type: Option<ConnectionType>,
    #[serde(default)]
    pub use_pty: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Minutes; 0 disables the idle sweep for this session.
    #[serde(default)]
    pub max_idle_time: u32,
    #[serde(default)]
    pub audit_logging: AuditLogging,
    #[serde(default)]
    pub font_size: Option<u32>,
    #[serde(default)]
    pub visible_to_all: bool,
    #[serde(default)]
    pub web_user_name: String,
    #[serde(default)]
    pub web_user_role: String,
    #[serde(default)]
    pub web_user_ip: String,
    /// Issue time, stamped by the gateway.
    #[serde(default)]
    pub in_time: Option<String>,
}

impl TokenRequest {
    /// Session type, defaulting to NEW.
    pub fn session_type(&self) -> SessionType {
        self.session_type.unwrap_or(SessionType::New)
    }

    /// Minimal-field contract: an attach request needs a parent token, a new
    /// session needs a host and a protocol (and a username for ssh).
    pub fn is_acceptable(&self) -> bool {
        let attach = matches!(
            self.session_type,
            Some(SessionType::Join | SessionType::Watch | SessionType::Take)
        ) && not_empty(&self.parent_token);

        let new = not_empty(&self.host)
            && match self.connection_type {
                Some(ConnectionType::Telnet | ConnectionType::Tn3270) => true,
                Some(ConnectionType::Ssh) => not_empty(&self.username),
                None => false,
            };

        attach || new
    }

    /// Fill in defaults: session type, port, font size, and force a local
    /// PTY for tn3270 or for ssh without a password.
    pub fn apply_defaults(&mut self) {
        if self.session_type.is_none() {
            self.session_type = Some(SessionType::New);
        }
        if let Some(ct) = self.connection_type {
            if self.port.is_none() {
                self.port = Some(ct.default_port());
            }
            let no_password = !not_empty(&self.password);
            if ct == ConnectionType::Tn3270 || (ct == ConnectionType::Ssh && no_password) {
                self.use_pty = true;
            }
        }
        if self.font_size.is_none() {
            self.font_size = Some(DEFAULT_FONT_SIZE);
        }
    }

    pub fn is_admin(&self) -> bool {
        self.web_user_role == ROLE_ADMIN
    }

    /// Copy with the password replaced by the mask.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        if copy.password.is_some() {
            copy.password = Some(PASSWORD_MASK.to_string());
        }
        copy
    }
}

impl fmt::Debug for TokenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRequest")
            .field("session_type", &self.session_type)
            .field("parent_token", &self.parent_token)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connection_type", &self.connection_type)
            .field("use_pty", &self.use_pty)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| PASSWORD_MASK))
            .field("description", &self.description)
            .field("max_idle_time", &self.max_idle_time)
            .field("audit_logging", &self.audit_logging)
            .field("visible_to_all", &self.visible_to_all)
            .field("web_user_name", &self.web_user_name)
            .field("web_user_role", &self.web_user_role)
            .field("web_user_ip", &self.web_user_ip)
            .finish()
    }
}

fn not_empty(s: &Option<String>) -> bool {
    s.as_deref().map(|v| !v.is_empty()).unwrap_or(false)
}

/// Outcome of the token issue phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Success,
    Failure,
}

/// `{status, payload}` returned to the HTTP layer; payload is the token on
/// success or a reason on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub status: TokenStatus,
    pub payload: String,
}

impl TokenResponse {
    pub fn success(token: impl Into<String>) -> Self {
        Self {
            status: TokenStatus::Success,
            payload: token.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: TokenStatus::Failure,
            payload: reason.into(),
        }
    }
}
