//! Local PTY backend using portable-pty.
//!
//! Runs the system `telnet`, `ssh` or `c3270` client inside a pseudo-terminal
//! at the session's geometry. A blocking reader feeds output into the backend
//! link; a blocking command loop applies input, resizes and the final kill.

use super::io::{BackendCommand, BackendIo, BackendPeer};
use super::DialTarget;
use crate::config::BackendConfig;
use crate::prompt::{match_prompt_and_submit, LOGIN_PROMPTS, PASSWORD_PROMPTS};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use webterm_core::{ConnectionType, GatewayError, GatewayResult};

// Executable checks pass once per process lifetime per protocol.
static TELNET_OK: AtomicBool = AtomicBool::new(false);
static SSH_OK: AtomicBool = AtomicBool::new(false);
static C3270_OK: AtomicBool = AtomicBool::new(false);

fn installed_flag(ct: ConnectionType) -> &'static AtomicBool {
    match ct {
        ConnectionType::Telnet => &TELNET_OK,
        ConnectionType::Ssh => &SSH_OK,
        ConnectionType::Tn3270 => &C3270_OK,
    }
}

fn check_installed(ct: ConnectionType, program: &Path) -> GatewayResult<()> {
    let flag = installed_flag(ct);
    if flag.load(Ordering::Acquire) {
        return Ok(());
    }
    if !program.exists() {
        let label = match ct {
            ConnectionType::Telnet => "TELNET",
            ConnectionType::Ssh => "SSH",
            ConnectionType::Tn3270 => "TN3270",
        };
        return Err(GatewayError::Config(format!("{label}/pty NOT SET UP for APP")));
    }
    flag.store(true, Ordering::Release);
    Ok(())
}

/// Program and arguments for the target's protocol.
pub fn command_line(cfg: &BackendConfig, target: &DialTarget) -> (PathBuf, Vec<String>) {
    let port = target.port.to_string();
    match target.connection_type {
        ConnectionType::Telnet => {
            let mut args = vec!["-e".to_string(), "''".to_string(), target.host.clone()];
            if target.port != 23 {
                args.push(port);
            }
            (cfg.telnet_cmd.clone(), args)
        }
        ConnectionType::Ssh => {
            let args = vec![
                "-q".to_string(),
                "-oUserKnownHostsFile=/dev/null".to_string(),
                "-oStrictHostKeyChecking=no".to_string(),
                "-oKexAlgorithms=+diffie-hellman-group1-sha1".to_string(),
                "-oHostKeyAlgorithms=+ssh-rsa,ssh-dss".to_string(),
                "-p".to_string(),
                port,
                "-l".to_string(),
                target.username.clone().unwrap_or_default(),
                target.host.clone(),
            ];
            (cfg.ssh_cmd.clone(), args)
        }
        ConnectionType::Tn3270 => (
            cfg.c3270_cmd.clone(),
            vec!["-secure".to_string(), target.host.clone(), port],
        ),
    }
}

/// Spawn the protocol client in a fresh PTY.
pub fn spawn(cfg: &BackendConfig, target: &DialTarget) -> GatewayResult<BackendIo> {
    let (program, args) = command_line(cfg, target);
    check_installed(target.connection_type, &program)?;

    let size = PtySize {
        rows: target.rows,
        cols: target.cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    let pair = native_pty_system()
        .openpty(size)
        .map_err(|e| GatewayError::Other(format!("failed to open PTY: {e}")))?;

    let mut cmd = CommandBuilder::new(&program);
    cmd.args(&args);
    cmd.env("TERM", "xterm");

    debug!(program = %program.display(), ?args, "pty command");
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| GatewayError::Other(format!("failed to spawn command: {e}")))?;
    drop(pair.slave);

    info!(
        host = %target.host,
        port = target.port,
        cols = target.cols,
        rows = target.rows,
        "PTY spawned"
    );

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| GatewayError::Other(format!("failed to clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| GatewayError::Other(format!("failed to take PTY writer: {e}")))?;

    let (io, peer) = BackendIo::pair();
    let BackendPeer { output, commands } = peer;

    tokio::task::spawn_blocking(move || read_loop(reader, output));
    tokio::task::spawn_blocking(move || command_loop(pair.master, writer, child, commands));

    Ok(io)
}

fn read_loop(mut reader: Box<dyn Read + Send>, output: tokio::sync::mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }
    debug!("PTY reader stopped");
}

fn command_loop(
    master: Box<dyn MasterPty + Send>,
    mut writer: Box<dyn Write + Send>,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    mut commands: tokio::sync::mpsc::UnboundedReceiver<BackendCommand>,
) {
    while let Some(cmd) = commands.blocking_recv() {
        match cmd {
            BackendCommand::Data(data) => {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    warn!(error = %e, "PTY write failed");
                    break;
                }
            }
            BackendCommand::Resize { rows, cols } => {
                let size = PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                };
                match master.resize(size) {
                    Ok(()) => debug!(cols, rows, "PTY resized"),
                    Err(e) => warn!(error = %e, "PTY resize failed"),
                }
            }
            BackendCommand::Close => break,
        }
    }

    if let Err(e) = child.kill() {
        debug!(error = %e, "PTY kill (already exited?)");
    }
    let _ = child.wait();
    debug!("PTY child reaped");
}

/// Auto-login inside the PTY: telnet submits the username (and then the
/// password, if any); ssh submits only the password; tn3270 never logs in.
pub async fn auto_login(
    io: &mut BackendIo,
    target: &DialTarget,
    bound: std::time::Duration,
) -> GatewayResult<()> {
    let username = target.username.as_deref().filter(|u| !u.is_empty());
    let password = target.password.as_deref().filter(|p| !p.is_empty());

    let sent_username = match (target.connection_type, username) {
        (ConnectionType::Telnet, Some(user)) => {
            match_prompt_and_submit(bound, &mut io.output, LOGIN_PROMPTS, user, &io.input).await?;
            true
        }
        _ => false,
    };

    let wants_password = sent_username || target.connection_type == ConnectionType::Ssh;
    if let (true, Some(pw)) = (wants_password, password) {
        match_prompt_and_submit(bound, &mut io.output, PASSWORD_PROMPTS, pw, &io.input).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn target(ct: ConnectionType, port: u16) -> DialTarget {
        DialTarget {
            connection_type: ct,
            host: "h".into(),
            port,
            username: Some("u".into()),
            password: Some("p".into()),
            rows: 24,
            cols: 80,
        }
    }

    #[test]
    fn telnet_omits_default_port() {
        let cfg = BackendConfig::default();
        let (prog, args) = command_line(&cfg, &target(ConnectionType::Telnet, 23));
        assert_eq!(prog, PathBuf::from("/usr/bin/telnet"));
        assert_eq!(args, vec!["-e", "''", "h"]);

        let (_, args) = command_line(&cfg, &target(ConnectionType::Telnet, 2323));
        assert_eq!(args.last().map(String::as_str), Some("2323"));
    }

    #[test]
    fn ssh_and_3270_arguments() {
        let cfg = BackendConfig::default();
        let (_, args) = command_line(&cfg, &target(ConnectionType::Ssh, 2222));
        assert_eq!(&args[args.len() - 5..], &["-p", "2222", "-l", "u", "h"]);
        assert!(args.contains(&"-oStrictHostKeyChecking=no".to_string()));

        let (prog, args) = command_line(&cfg, &target(ConnectionType::Tn3270, 23));
        assert_eq!(prog, PathBuf::from("/usr/bin/c3270"));
        assert_eq!(args, vec!["-secure", "h", "23"]);
    }

    #[test]
    fn missing_executable_is_config_error() {
        let err = check_installed(
            ConnectionType::Tn3270,
            Path::new("/nonexistent/webterm/c3270"),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "ConfigError: TN3270/pty NOT SET UP for APP");
    }

    #[tokio::test]
    async fn ssh_auto_login_sends_password_only() {
        let (mut io, mut peer) = BackendIo::pair();
        peer.output.send(b"u@h's Password: ".to_vec()).await.unwrap();
        auto_login(&mut io, &target(ConnectionType::Ssh, 22), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            peer.commands.recv().await,
            Some(BackendCommand::Data(b"p\n".to_vec()))
        );
    }

    #[tokio::test]
    async fn tn3270_never_logs_in() {
        let (mut io, mut peer) = BackendIo::pair();
        auto_login(&mut io, &target(ConnectionType::Tn3270, 23), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(peer.commands.try_recv().is_err());
    }
}
