//! Gateway configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use webterm_core::{ConnectionType, GatewayError, GatewayResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub backend: BackendSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            control_port: default_control_port(),
            bind: default_bind(),
        }
    }
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u64,
    #[serde(default = "default_token_sweep_interval")]
    pub token_sweep_interval: u64,
    #[serde(default = "default_idle_sweep_interval")]
    pub idle_sweep_interval: u64,
    #[serde(default = "default_replay_bytes")]
    pub replay_bytes: usize,
    #[serde(default = "default_replay_bytes_tn3270")]
    pub replay_bytes_tn3270: usize,
    #[serde(default = "default_audit_log_dir")]
    pub audit_log_dir: String,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            token_ttl: default_token_ttl(),
            token_sweep_interval: default_token_sweep_interval(),
            idle_sweep_interval: default_idle_sweep_interval(),
            replay_bytes: default_replay_bytes(),
            replay_bytes_tn3270: default_replay_bytes_tn3270(),
            audit_log_dir: default_audit_log_dir(),
        }
    }
}

/// `[backend]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    #[serde(default = "default_telnet_cmd")]
    pub telnet_cmd: String,
    #[serde(default = "default_ssh_cmd")]
    pub ssh_cmd: String,
    #[serde(default = "default_c3270_cmd")]
    pub c3270_cmd: String,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    #[serde(default = "default_channel_timeout")]
    pub channel_timeout: u64,
    #[serde(default = "default_prompt_timeout")]
    pub prompt_timeout: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            telnet_cmd: default_telnet_cmd(),
            ssh_cmd: default_ssh_cmd(),
            c3270_cmd: default_c3270_cmd(),
            dial_timeout: default_dial_timeout(),
            channel_timeout: default_channel_timeout(),
            prompt_timeout: default_prompt_timeout(),
        }
    }
}

fn default_port() -> u16 {
    8022
}
fn default_control_port() -> u16 {
    8023
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_token_ttl() -> u64 {
    60
}
fn default_token_sweep_interval() -> u64 {
    30
}
fn default_idle_sweep_interval() -> u64 {
    60
}
fn default_replay_bytes() -> usize {
    24 * 80
}
fn default_replay_bytes_tn3270() -> usize {
    2 * 24 * 80
}
fn default_audit_log_dir() -> String {
    "~/.webterm/audit".to_string()
}
fn default_telnet_cmd() -> String {
    "/usr/bin/telnet".to_string()
}
fn default_ssh_cmd() -> String {
    "/usr/bin/ssh".to_string()
}
fn default_c3270_cmd() -> String {
    "/usr/bin/c3270".to_string()
}
fn default_dial_timeout() -> u64 {
    10
}
fn default_channel_timeout() -> u64 {
    5
}
fn default_prompt_timeout() -> u64 {
    6
}

/// Settings consumed by backends when they dial or spawn.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub telnet_cmd: PathBuf,
    pub ssh_cmd: PathBuf,
    pub c3270_cmd: PathBuf,
    pub dial_timeout: Duration,
    pub channel_timeout: Duration,
    pub prompt_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendSection::default().into()
    }
}

impl From<BackendSection> for BackendConfig {
    fn from(s: BackendSection) -> Self {
        Self {
            telnet_cmd: expand_tilde_str(&s.telnet_cmd),
            ssh_cmd: expand_tilde_str(&s.ssh_cmd),
            c3270_cmd: expand_tilde_str(&s.c3270_cmd),
            dial_timeout: Duration::from_secs(s.dial_timeout),
            channel_timeout: Duration::from_secs(s.channel_timeout),
            prompt_timeout: Duration::from_secs(s.prompt_timeout),
        }
    }
}

/// Settings consumed by the session registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub token_ttl: Duration,
    pub replay_bytes: usize,
    pub replay_bytes_tn3270: usize,
    pub audit_log_dir: PathBuf,
    pub backend: BackendConfig,
}

impl RegistryConfig {
    /// Replay budget for a root session speaking `ct`.
    pub fn replay_budget(&self, ct: Option<ConnectionType>) -> usize {
        match ct {
            Some(ConnectionType::Tn3270) => self.replay_bytes_tn3270,
            _ => self.replay_bytes,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let s = SessionsSection::default();
        Self {
            token_ttl: Duration::from_secs(s.token_ttl),
            replay_bytes: s.replay_bytes,
            replay_bytes_tn3270: s.replay_bytes_tn3270,
            audit_log_dir: expand_tilde_str(&s.audit_log_dir),
            backend: BackendConfig::default(),
        }
    }
}

/// Resolved gateway configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub control_port: u16,
    pub token_sweep_interval: Duration,
    pub idle_sweep_interval: Duration,
    pub registry: RegistryConfig,
}

/// CLI values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub control_port: Option<u16>,
    pub bind: Option<String>,
    pub token_ttl: Option<u64>,
    pub audit_log_dir: Option<String>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> GatewayResult<Self> {
        let bind_str = cli.bind.unwrap_or(file.server.bind);
        let bind: IpAddr = bind_str
            .parse()
            .map_err(|e| GatewayError::Config(format!("bad bind address {bind_str}: {e}")))?;
        let token_ttl = cli.token_ttl.unwrap_or(file.sessions.token_ttl);
        let audit_dir = cli.audit_log_dir.unwrap_or(file.sessions.audit_log_dir);

        Ok(Self {
            bind,
            port: cli.port.unwrap_or(file.server.port),
            control_port: cli.control_port.unwrap_or(file.server.control_port),
            token_sweep_interval: Duration::from_secs(file.sessions.token_sweep_interval.max(1)),
            idle_sweep_interval: Duration::from_secs(file.sessions.idle_sweep_interval.max(1)),
            registry: RegistryConfig {
                token_ttl: Duration::from_secs(token_ttl),
                replay_bytes: file.sessions.replay_bytes,
                replay_bytes_tn3270: file.sessions.replay_bytes_tn3270,
                audit_log_dir: expand_tilde_str(&audit_dir),
                backend: file.backend.into(),
            },
        })
    }
}

fn parse(content: &str) -> GatewayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = ServerConfig::resolve(parse("").unwrap(), CliOverrides::default()).unwrap();
        assert_eq!(cfg.port, 8022);
        assert_eq!(cfg.control_port, 8023);
        assert_eq!(cfg.registry.token_ttl, Duration::from_secs(60));
        assert_eq!(cfg.registry.replay_bytes, 1920);
        assert_eq!(cfg.registry.replay_budget(Some(ConnectionType::Tn3270)), 3840);
        assert_eq!(cfg.registry.backend.prompt_timeout, Duration::from_secs(6));
    }

    #[test]
    fn cli_overrides_file() {
        let file = parse(
            r#"
            [server]
            port = 9000
            bind = "127.0.0.1"

            [sessions]
            token_ttl = 5

            [backend]
            ssh_cmd = "/opt/ssh"
            "#,
        )
        .unwrap();
        let cli = CliOverrides {
            port: Some(9100),
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(file, cli).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.bind.to_string(), "127.0.0.1");
        assert_eq!(cfg.registry.token_ttl, Duration::from_secs(5));
        assert_eq!(cfg.registry.backend.ssh_cmd, PathBuf::from("/opt/ssh"));
    }

    #[test]
    fn bad_bind_is_config_error() {
        let cli = CliOverrides {
            bind: Some("nowhere".into()),
            ..Default::default()
        };
        let err = ServerConfig::resolve(ConfigFile::default(), cli).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(
            Some(&dir.path().join("absent.toml")),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.port, 8022);
    }
}
