//! Two-phase token handshake.
//!
//! 1. Issue: the HTTP layer hands over a validated [`TokenRequest`]; once it
//!    passes the ownership check a random token is stored with its issue time.
//! 2. Redeem: the browser's `connect` message presents the token, which is
//!    removed atomically so it can be used exactly once.
//!
//! Tokens that are never redeemed are purged by [`TokenTable::sweep`].

use crate::session::SessionInfo;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use webterm_core::{GatewayError, GatewayResult, SessionType, TokenRequest};

/// Payload returned when a request fails validation or authorization.
pub const INVALID_REQUEST: &str = "Invalid Request";

/// Reason surfaced when a token is unknown or already used.
pub const TOKEN_NOT_FOUND: &str = "Session Token Not Found";

/// A token waiting to be redeemed.
#[derive(Debug, Clone)]
pub struct PendingToken {
    pub request: TokenRequest,
    pub issued: Instant,
}

/// Masked view of a pending token for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct PendingView {
    pub token: String,
    pub request: TokenRequest,
    pub age_secs: u64,
}

/// Token → request table.
#[derive(Debug)]
pub struct TokenTable {
    entries: DashMap<String, PendingToken>,
    ttl: Duration,
}

impl TokenTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Store `request` under a fresh token.
    pub fn insert(&self, request: TokenRequest, now: Instant) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        debug!(token = %token, request = ?request, "token issued");
        self.entries.insert(
            token.clone(),
            PendingToken {
                request,
                issued: now,
            },
        );
        token
    }

    /// Remove and return the request; a token redeems at most once.
    pub fn redeem(&self, token: &str) -> GatewayResult<TokenRequest> {
        self.entries
            .remove(token)
            .map(|(_, pending)| pending.request)
            .ok_or_else(|| GatewayError::NotFound(TOKEN_NOT_FOUND.into()))
    }

    /// Drop tokens older than the TTL. Returns how many were purged.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, p| now.saturating_duration_since(p.issued) <= ttl);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            info!(purged, "expired tokens purged");
        }
        purged
    }

    /// Snapshot with passwords masked.
    pub fn pending(&self) -> Vec<PendingView> {
        self.entries
            .iter()
            .map(|e| PendingView {
                token: e.key().clone(),
                request: e.value().request.masked(),
                age_secs: e.value().issued.elapsed().as_secs(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Validate the minimal-field contract, then fill defaults and stamp the
/// issue time.
pub fn prepare(mut request: TokenRequest) -> GatewayResult<TokenRequest> {
    if !request.is_acceptable() {
        return Err(GatewayError::Permission(INVALID_REQUEST.into()));
    }
    request.apply_defaults();
    request.in_time = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
    Ok(request)
}

/// Ownership check. ADMIN always passes; an attach request needs a root owned
/// by the requester or marked visible to all; a NEW request is always fine.
pub fn authorize(request: &TokenRequest, root: Option<&SessionInfo>) -> GatewayResult<()> {
    if request.is_admin() {
        return Ok(());
    }
    if request.session_type() == SessionType::New && request.parent_token.is_none() {
        return Ok(());
    }
    match root {
        Some(r) if r.web_user_name == request.web_user_name || r.visible_to_all => Ok(()),
        _ => Err(GatewayError::Permission(INVALID_REQUEST.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webterm_core::{ConnectionType, ROLE_ADMIN};

    fn new_request() -> TokenRequest {
        TokenRequest {
            host: Some("h".into()),
            connection_type: Some(ConnectionType::Ssh),
            username: Some("u".into()),
            password: Some("p".into()),
            web_user_name: "alice".into(),
            ..Default::default()
        }
    }

    fn join_request(user: &str) -> TokenRequest {
        TokenRequest {
            session_type: Some(SessionType::Join),
            parent_token: Some("root-token".into()),
            web_user_name: user.into(),
            ..Default::default()
        }
    }

    fn root_info(owner: &str) -> SessionInfo {
        let mut req = new_request();
        req.web_user_name = owner.into();
        SessionInfo::from_request("sid".into(), "root-token".into(), req, 24, 80)
    }

    #[test]
    fn redeem_is_single_use() {
        let table = TokenTable::new(Duration::from_secs(60));
        let token = table.insert(new_request(), Instant::now());
        assert!(table.redeem(&token).is_ok());
        let err = table.redeem(&token).unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(err.to_string(), TOKEN_NOT_FOUND);
    }

    #[test]
    fn sweep_purges_after_ttl() {
        let table = TokenTable::new(Duration::from_secs(60));
        let issued = Instant::now();
        let token = table.insert(new_request(), issued);

        assert_eq!(table.sweep(issued + Duration::from_secs(60)), 0);
        assert_eq!(table.len(), 1);

        assert_eq!(table.sweep(issued + Duration::from_secs(61)), 1);
        assert!(table.redeem(&token).is_err());
    }

    #[test]
    fn pending_masks_passwords() {
        let table = TokenTable::new(Duration::from_secs(60));
        table.insert(new_request(), Instant::now());
        let views = table.pending();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].request.password.as_deref(), Some("*"));
    }

    #[test]
    fn prepare_stamps_and_defaults() {
        let req = prepare(new_request()).unwrap();
        assert_eq!(req.session_type, Some(SessionType::New));
        assert_eq!(req.port, Some(22));
        let stamp = req.in_time.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());

        let mut bad = new_request();
        bad.host = None;
        assert!(matches!(prepare(bad), Err(GatewayError::Permission(_))));
    }

    #[test]
    fn authorization_rules() {
        assert!(authorize(&new_request(), None).is_ok());

        assert!(authorize(&join_request("alice"), Some(&root_info("alice"))).is_ok());
        assert!(authorize(&join_request("bob"), Some(&root_info("alice"))).is_err());
        assert!(authorize(&join_request("bob"), None).is_err());

        let mut shared = root_info("alice");
        shared.visible_to_all = true;
        assert!(authorize(&join_request("bob"), Some(&shared)).is_ok());

        let mut admin = join_request("root");
        admin.web_user_role = ROLE_ADMIN.into();
        assert!(authorize(&admin, None).is_ok());
    }
}
