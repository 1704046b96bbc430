//! Direct SSH backend using russh.
//!
//! Host keys are accepted unconditionally: the gateway relies on network
//! placement rather than known_hosts.

use super::io::{BackendCommand, BackendIo, BackendPeer};
use super::DialTarget;
use crate::config::BackendConfig;
use russh::keys::PublicKey;
use russh::{client, ChannelMsg};
use std::sync::Arc;
use tracing::{debug, error, info};
use webterm_core::{GatewayError, GatewayResult};

/// russh callback handler; accepts every host key.
pub struct TrustingHandler;

impl client::Handler for TrustingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn dial_error(e: russh::Error) -> GatewayError {
    GatewayError::Dial(e.to_string())
}

/// Dial, authenticate with the password and open an xterm shell channel.
pub async fn connect(cfg: &BackendConfig, target: &DialTarget) -> GatewayResult<BackendIo> {
    info!(host = %target.host, port = target.port, "ssh connect");

    let ssh_config = client::Config {
        inactivity_timeout: None,
        ..Default::default()
    };

    let mut handle = tokio::time::timeout(
        cfg.dial_timeout,
        client::connect(
            Arc::new(ssh_config),
            (target.host.as_str(), target.port),
            TrustingHandler,
        ),
    )
    .await
    .map_err(|_| GatewayError::Dial("timeout: socket is not established".into()))?
    .map_err(dial_error)?;

    let username = target.username.clone().unwrap_or_default();
    let password = target.password.clone().unwrap_or_default();
    let auth = handle
        .authenticate_password(username, password)
        .await
        .map_err(|e| GatewayError::Auth(e.to_string()))?;
    if !auth.success() {
        return Err(GatewayError::Auth("Auth fail".into()));
    }
    debug!("ssh authenticated");

    let channel = tokio::time::timeout(cfg.channel_timeout, async {
        let channel = handle.channel_open_session().await?;
        channel
            .request_pty(false, "xterm", u32::from(target.cols), u32::from(target.rows), 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        Ok::<_, russh::Error>(channel)
    })
    .await
    .map_err(|_| GatewayError::Dial("channel is not opened".into()))?
    .map_err(dial_error)?;

    info!(host = %target.host, "ssh shell started");

    let (io, peer) = BackendIo::pair();
    tokio::spawn(channel_loop(handle, channel, peer));
    Ok(io)
}

async fn channel_loop(
    handle: client::Handle<TrustingHandler>,
    mut channel: russh::Channel<client::Msg>,
    peer: BackendPeer,
) {
    let BackendPeer {
        output,
        mut commands,
    } = peer;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(BackendCommand::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            error!(error = %e, "ssh channel write failed");
                            break;
                        }
                    }
                    Some(BackendCommand::Resize { rows, cols }) => {
                        if let Err(e) = channel
                            .window_change(u32::from(cols), u32::from(rows), 0, 0)
                            .await
                        {
                            error!(error = %e, "ssh window change failed");
                        }
                    }
                    Some(BackendCommand::Close) | None => {
                        let _ = channel.eof().await;
                        break;
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if output.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        if output.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        debug!("ssh channel closed by peer");
                        break;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!(exit_status, "ssh exit status");
                    }
                    Some(_) => {}
                }
            }
        }
    }

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "English")
        .await;
    debug!("ssh session disconnected");
}
