//! Persistent per-session audit log.
//!
//! The file is created lazily on first output and appended as plain text.
//! Writes are best-effort: failures are logged and never interrupt the session.

use super::info::SessionInfo;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

/// Audit writer for one root session.
pub struct AuditLog {
    path: PathBuf,
    file: Option<File>,
    closed: bool,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            closed: false,
        }
    }

    /// Writer for `info`, placed under `dir`.
    pub fn for_session(dir: &Path, info: &SessionInfo) -> Self {
        Self::new(dir.join(file_name(info)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append text, opening the file on first use.
    pub async fn append(&mut self, text: &str) {
        if self.closed || text.is_empty() {
            return;
        }
        if let Err(e) = self.try_append(text).await {
            error!(path = %self.path.display(), error = %e, "failed to write audit log");
        }
    }

    async fn try_append(&mut self, text: &str) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            debug!(path = %self.path.display(), "audit log opened");
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(text.as_bytes()).await?;
        }
        Ok(())
    }

    /// Flush and close; later appends are ignored.
    pub async fn close(&mut self) {
        self.closed = true;
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                error!(path = %self.path.display(), error = %e, "failed to flush audit log");
            }
            debug!(path = %self.path.display(), "audit log closed");
        }
    }
}

/// `<ct>_<host>_<port>_<desc>_<user>@<ip>_<inTime>.log`, `:` replaced by `_`.
pub fn file_name(info: &SessionInfo) -> String {
    let ct = info
        .connection_type
        .map(|c| c.as_str().to_string())
        .unwrap_or_default();
    let name = format!(
        "{}_{}_{}_{}_{}@{}_{}.log",
        ct,
        info.host.as_deref().unwrap_or(""),
        info.port.map(|p| p.to_string()).unwrap_or_default(),
        info.description.as_deref().unwrap_or(""),
        info.web_user_name,
        info.web_user_ip,
        info.in_time,
    );
    name.replace(':', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use webterm_core::{ConnectionType, TokenRequest};

    fn info() -> SessionInfo {
        let req = TokenRequest {
            host: Some("db01".into()),
            port: Some(23),
            connection_type: Some(ConnectionType::Telnet),
            description: Some("nightly".into()),
            web_user_name: "alice".into(),
            web_user_ip: "10.0.0.1".into(),
            in_time: Some("2024-01-02T03:04:05Z".into()),
            ..Default::default()
        };
        SessionInfo::from_request("sid".into(), "tok".into(), req, 24, 80)
    }

    #[test]
    fn file_name_replaces_colons() {
        assert_eq!(
            file_name(&info()),
            "telnet_db01_23_nightly_alice@10.0.0.1_2024-01-02T03_04_05Z.log"
        );
    }

    #[tokio::test]
    async fn lazily_created_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::for_session(&dir.path().join("audit"), &info());
        assert!(!log.path().exists());

        log.append("hello ").await;
        log.append("world").await;
        log.close().await;
        log.append("ignored").await;

        let content = tokio::fs::read_to_string(log.path()).await.unwrap();
        assert_eq!(content, "hello world");
    }
}
