//! JOIN / WATCH / TAKE: sessions that ride on an existing root.
//!
//! A child either attaches to the root's output fan-out (JOIN may type, WATCH
//! only observes) or takes the root over, replacing its browser socket.

use super::Connection;
use crate::session::SessionRegistry;
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use webterm_core::{ServerMessage, SessionType};

pub const JOIN_READY: &str = "Join Session ready";
pub const WATCH_READY: &str = "ReadOnly Session attached";
pub const NO_LONGER_AVAILABLE: &str = "Session No Longer Available";

/// Non-owning link from a child to its root.
///
/// Weak rather than an id: a takeover rewrites the root's session id.
#[derive(Debug, Clone, Default)]
pub struct JoinProxy {
    root: Weak<Connection>,
}

impl JoinProxy {
    pub fn new(root: Option<&Arc<Connection>>) -> Self {
        Self {
            root: root.map(Arc::downgrade).unwrap_or_default(),
        }
    }

    /// The root, unless it has been dropped or closed.
    pub fn root(&self) -> Option<Arc<Connection>> {
        self.root.upgrade().filter(|r| !r.is_closed())
    }
}

impl SessionRegistry {
    /// Connect routine for a child session.
    pub(crate) async fn connect_join(&self, child: Arc<Connection>) {
        let root = match child.join_root() {
            Some(r) if r.is_alive() => r,
            // still dialing or logging in: turn the child away, leave the root be
            Some(r) if !r.with_info(|i| i.ready) => {
                debug!(session_id = %child.session_id(), "root not ready, attach refused");
                child.notice(NO_LONGER_AVAILABLE);
                self.close(&child).await;
                return;
            }
            other => {
                if let Some(r) = other {
                    self.close(&r).await;
                }
                child.notice(NO_LONGER_AVAILABLE);
                self.close(&child).await;
                return;
            }
        };

        let root_info = root.info_snapshot();
        child.update_info(|c| c.inherit_target(&root_info));

        if root_info.suspended || child.session_type() == SessionType::Take {
            self.takeover(&root, &child);
        } else {
            self.attach(&root, &child);
        }
    }

    /// Add `child` to the root's fan-out after sending it the backlog.
    fn attach(&self, root: &Arc<Connection>, child: &Arc<Connection>) {
        let (child_id, session_type) = child.update_info(|c| {
            c.ready = true;
            (c.session_id.clone(), c.session_type)
        });

        {
            // Holding the root's replay lock keeps live output out until the
            // child is in the fan-out set.
            let replay = root.replay();
            child.notice(if session_type == SessionType::Watch {
                WATCH_READY
            } else {
                JOIN_READY
            });
            if !replay.is_empty() {
                debug!(session_id = %child_id, backlog = replay.len(), "replaying backlog");
                child.send_frame(ServerMessage::Output(replay.snapshot()));
            }
            root.add_child(&child_id);
        }

        info!(session_id = %child_id, %session_type, "child attached");
        self.update_participants(root);
    }

    /// Move the child's socket, token and session id onto the root.
    fn takeover(&self, root: &Arc<Connection>, child: &Arc<Connection>) {
        let (child_id, child_token, user, role, ip, rows, cols) = child.with_info(|c| {
            (
                c.session_id.clone(),
                c.token.clone(),
                c.web_user_name.clone(),
                c.web_user_role.clone(),
                c.web_user_ip.clone(),
                c.rows,
                c.cols,
            )
        });
        debug!(session_id = %child_id, "take over root");

        root.notice(&format!("Session taken by {user}"));

        let new_sink = child.replace_sink(None);
        let old_sink = {
            let replay = root.replay();
            let old_sink = root.replace_sink(new_sink);
            let old_id = root.update_info(|r| {
                let old = std::mem::replace(&mut r.session_id, child_id.clone());
                r.token = child_token;
                r.suspended = false;
                r.web_user_name = user.clone();
                r.web_user_role = role;
                r.web_user_ip = ip;
                r.ready = true;
                old
            });
            self.rebind(&old_id, &child_id, root);
            if !replay.is_empty() {
                root.send_frame(ServerMessage::Output(replay.snapshot()));
            }
            old_sink
        };
        // the child object is retired; its socket now belongs to the root
        child.mark_closed();

        self.resize_root(root, rows, cols);

        // only after the swap is committed
        if let Some(old) = old_sink {
            old.close();
        }
        info!(session_id = %child_id, user = %user, "session taken over");
    }
}
