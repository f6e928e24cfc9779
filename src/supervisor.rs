//! Component I: the per-connection task that drives the state machine from
//! "session-ready" through upstream dial to the bridge, and guarantees
//! teardown on every exit path.
//!
//! Grounded on `examples/shell-pool-shpool/src/daemon/shell.rs`'s
//! `bidi_stream`, which plays the same role for the teacher's local
//! PTY-bridge daemon: own the shared session state, spawn the workers that
//! move bytes, and unconditionally tear everything down when any of them
//! finishes.

use std::sync::Arc;

use russh::server;
use russh::ChannelId;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::bridge;
use crate::session_request::{DownstreamEvent, SessionState};
use crate::upstream;

/// Spawns the task that dials upstream and drives the bridge. Only ever
/// called once `state.mode` has already been recorded by the handler
/// callback that requested the shell/exec/subsystem (the `AWAIT_SESSION`
/// 30s timeout for a connection that never reaches that point is enforced
/// separately, by a watchdog spawned alongside the session channel — see
/// `downstream.rs::channel_open_session`).
pub fn spawn(
    state: Arc<SessionState>,
    handle: server::Handle,
    channel: ChannelId,
    target_ssh_port: u16,
    bridge_tx: watch::Sender<Option<mpsc::UnboundedSender<DownstreamEvent>>>,
) {
    tokio::spawn(async move {
        run(state, handle, channel, target_ssh_port, bridge_tx).await;
    });
}

async fn run(
    state: Arc<SessionState>,
    handle: server::Handle,
    channel: ChannelId,
    target_ssh_port: u16,
    bridge_tx: watch::Sender<Option<mpsc::UnboundedSender<DownstreamEvent>>>,
) {
    let mode = match state.mode.get() {
        Some(mode) => mode.clone(),
        None => {
            error!("supervisor woke with no session mode recorded");
            let _ = handle.close(channel).await;
            return;
        }
    };
    let pty = state.pty.lock().await.clone();

    info!(
        vm_id = state.target.vm_id,
        username = %state.username,
        "dialing upstream"
    );

    let upstream_session = match upstream::connect_and_open(
        &state.target.internal_ip,
        target_ssh_port,
        &state.username,
        state.password.expose(),
        &mode,
        pty,
    )
    .await
    {
        Ok(session) => session,
        Err(err) => {
            error!(vm_id = state.target.vm_id, error = %err, "upstream dial failed");
            // Dropping `bridge_tx` without ever sending `Some(..)` closes
            // the watch channel, which is what tells any handler callback
            // still waiting in `wait_for_bridge` to give up.
            drop(bridge_tx);
            let message = format!("proxy: {}\r\n", err);
            let _ = handle.data(channel, russh::CryptoVec::from(message.into_bytes())).await;
            // §7 UpstreamDialFail: exec/subsystem sessions get an explicit
            // exit-status of 1 rather than just an abrupt close — a shell
            // has no exit-status concept, so it is skipped there.
            if !matches!(mode, crate::session_request::Mode::Shell) {
                let _ = handle.exit_status_request(channel, crate::consts::FALLBACK_EXIT_STATUS).await;
            }
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
            return;
        }
    };

    crate::test_hooks::emit!("upstream-connected");
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = bridge_tx.send(Some(tx));

    let sends_exit_status = !matches!(mode, crate::session_request::Mode::Shell);
    bridge::run(upstream_session, handle, channel, rx, sends_exit_status).await;
}
