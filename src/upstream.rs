//! Components E+F: dials the target VM as an SSH client and opens the
//! channel shape that matches the downstream session's mode.
//!
//! Grounded on `examples/other_examples/.../benfavre-shelldeck/session.rs`
//! for the `russh::client` call shapes (`channel_open_session`,
//! `request_pty`/`request_shell`, `exec`, `window_change`) and on
//! `examples/other_examples/.../warp-tech-warpgate/lib.rs` for the
//! trust-on-first-use `check_server_key` shape.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::Channel;
use tracing::warn;

use crate::consts::{UPSTREAM_DIAL_TIMEOUT_FILE_TRANSFER, UPSTREAM_DIAL_TIMEOUT_SHELL};
use crate::error::ProxyError;
use crate::session_request::{Mode, PtyRequest};

/// Trust-on-first-use: the bastion has no prior knowledge of tenant VM host
/// keys, so it accepts whatever key the target presents. Documented
/// limitation (see DESIGN.md); not configurable per spec §9.
pub struct UpstreamHandler;

#[async_trait]
impl client::Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An upstream SSH connection plus the single channel opened for this
/// session's mode.
pub struct UpstreamSession {
    pub handle: Handle<UpstreamHandler>,
    pub channel: Channel<client::Msg>,
}

fn dial_timeout_for(mode: &Mode) -> Duration {
    match mode {
        Mode::Shell => UPSTREAM_DIAL_TIMEOUT_SHELL,
        Mode::Exec(_) | Mode::Subsystem(_) => UPSTREAM_DIAL_TIMEOUT_FILE_TRANSFER,
    }
}

/// Dials the target VM, authenticates with the password the downstream
/// client presented, and opens + sets up the channel matching `mode`.
pub async fn connect_and_open(
    target_ip: &str,
    target_port: u16,
    username: &str,
    password: &str,
    mode: &Mode,
    pty: Option<PtyRequest>,
) -> Result<UpstreamSession, ProxyError> {
    let timeout = dial_timeout_for(mode);
    tokio::time::timeout(timeout, dial(target_ip, target_port, username, password, mode, pty))
        .await
        .map_err(|_| ProxyError::UpstreamDialFail(anyhow::anyhow!("dial timed out after {:?}", timeout)))?
}

async fn dial(
    target_ip: &str,
    target_port: u16,
    username: &str,
    password: &str,
    mode: &Mode,
    pty: Option<PtyRequest>,
) -> Result<UpstreamSession, ProxyError> {
    let addr: SocketAddr = format!("{}:{}", target_ip, target_port)
        .parse()
        .map_err(|e| ProxyError::UpstreamDialFail(anyhow::anyhow!("bad target address: {}", e)))?;

    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, addr, UpstreamHandler)
        .await
        .map_err(|e| ProxyError::UpstreamDialFail(e.into()))?;

    let authenticated = handle
        .authenticate_password(username, password)
        .await
        .map_err(|e| ProxyError::UpstreamDialFail(e.into()))?;
    if !authenticated.success() {
        return Err(ProxyError::UpstreamDialFail(anyhow::anyhow!(
            "upstream rejected credentials for {}",
            username
        )));
    }

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| ProxyError::UpstreamDialFail(e.into()))?;

    setup_channel(&channel, mode, pty).await?;

    Ok(UpstreamSession { handle, channel })
}

/// Mode-specific setup table (spec §4.F): a shell needs a PTY plus
/// `request_shell`; exec runs the command directly; a subsystem (e.g.
/// `sftp`) is requested by name. None of these reply-wait on the channel
/// window because the U→C pump (component G) takes over immediately after.
async fn setup_channel(
    channel: &Channel<client::Msg>,
    mode: &Mode,
    pty: Option<PtyRequest>,
) -> Result<(), ProxyError> {
    match mode {
        Mode::Shell => {
            let pty = pty.unwrap_or_default();
            channel
                .request_pty(false, &pty.term, pty.width, pty.height, 0, 0, &[])
                .await
                .map_err(|e| ProxyError::UpstreamDialFail(e.into()))?;
            channel
                .request_shell(false)
                .await
                .map_err(|e| ProxyError::UpstreamDialFail(e.into()))?;
        }
        Mode::Exec(command) => {
            let command = String::from_utf8_lossy(command);
            channel
                .exec(false, command.as_bytes())
                .await
                .map_err(|e| ProxyError::UpstreamDialFail(e.into()))?;
        }
        Mode::Subsystem(name) => {
            channel
                .request_subsystem(false, name)
                .await
                .map_err(|e| ProxyError::UpstreamDialFail(e.into()))?;
        }
    }
    Ok(())
}

/// Relays a downstream `window-change` request to the already-open upstream
/// channel, best effort — a resize that fails to propagate is not fatal to
/// the session.
pub async fn relay_window_change(channel: &Channel<client::Msg>, pty: PtyRequest) {
    if let Err(err) = channel.window_change(pty.width, pty.height, 0, 0).await {
        warn!(error = %err, "failed to relay window-change to upstream");
    }
}
