//! Session state: per-session records, replay backlog, audit log, registry.

pub mod audit;
pub mod info;
pub mod registry;
pub mod replay;

pub use audit::AuditLog;
pub use info::{generate_session_id, SessionInfo, SessionSummary};
pub use registry::SessionRegistry;
pub use replay::ReplayBuffer;
