//! Component G: the bidirectional bridge between the downstream server
//! channel and the upstream client channel.
//!
//! The two directions are realized asymmetrically (see SPEC_FULL.md §4.G).
//! This module owns the *single task* that has exclusive access to the
//! upstream `Channel` (required because `ChannelMsg::wait` needs `&mut
//! self`): it multiplexes upstream-originated messages against
//! downstream-originated events with `tokio::select!`, the same shape used
//! by `examples/other_examples/.../alexandrosnt-Reach/ssh-client.rs`'s
//! `ssh_session_task`.

use std::io::Cursor;

use russh::server;
use russh::{ChannelId, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::consts::{EXIT_STATUS_GRACE_PERIOD, FALLBACK_EXIT_STATUS};
use crate::error::ProxyError;
use crate::session_request::DownstreamEvent;
use crate::upstream::UpstreamSession;

/// Drives one session's bridge to completion. Returns once either side has
/// closed or an unrecoverable I/O error occurs; on every return path the
/// downstream channel is closed so the supervisor never has to remember to
/// do it itself.
pub async fn run(
    mut upstream: UpstreamSession,
    downstream: server::Handle,
    downstream_channel: ChannelId,
    mut rx: mpsc::UnboundedReceiver<DownstreamEvent>,
    sends_exit_status: bool,
) {
    let mut eof_seen = false;
    let mut downstream_closed = false;
    // Shell mode has no exit-status concept (spec §4.F: "n/a — channel
    // close is the signal"); mark it as already sent so the synthesized
    // status at the bottom never fires one for interactive shells.
    let mut exit_status_sent = !sends_exit_status;
    // §4.F/§7: a clean upstream close with no explicit `ExitStatus` message
    // reports 0; only a bridge I/O error on the forwarding path reports 1.
    // This starts "clean" and is flipped only by the forwarding-failure
    // branches below, never by an ordinary EOF/close/grace-period timeout.
    let mut had_error = false;

    loop {
        let msg = if eof_seen {
            tokio::select! {
                msg = upstream.channel.wait() => msg,
                _ = tokio::time::sleep(EXIT_STATUS_GRACE_PERIOD) => {
                    debug!("no exit status within grace period after upstream eof");
                    None
                }
            }
        } else if downstream_closed {
            // Nothing left to race against on the C→U side; just keep
            // draining upstream until it closes or exits.
            upstream.channel.wait().await
        } else {
            tokio::select! {
                msg = upstream.channel.wait() => msg,
                event = rx.recv() => {
                    if event.is_none() {
                        downstream_closed = true;
                    }
                    handle_downstream_event(&upstream, event).await;
                    continue;
                }
            }
        };

        match msg {
            Some(ChannelMsg::Data { data }) => {
                if let Err(source) = downstream.data(downstream_channel, data.clone()).await {
                    let err = ProxyError::BridgeIo(anyhow::anyhow!("{:?}", source));
                    warn!(error = %err, "downstream channel gone while forwarding upstream data");
                    had_error = true;
                    break;
                }
            }
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                if let Err(source) = downstream.extended_data(downstream_channel, 1, data.clone()).await {
                    let err = ProxyError::BridgeIo(anyhow::anyhow!("{:?}", source));
                    warn!(error = %err, "downstream channel gone while forwarding upstream stderr");
                    had_error = true;
                    break;
                }
            }
            Some(ChannelMsg::ExtendedData { .. }) => {}
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                if sends_exit_status {
                    let _ = downstream.exit_status_request(downstream_channel, exit_status).await;
                    exit_status_sent = true;
                }
                break;
            }
            Some(ChannelMsg::Eof) => {
                eof_seen = true;
            }
            Some(_) => {}
            None => break,
        }
    }

    if !exit_status_sent {
        let status = if had_error { FALLBACK_EXIT_STATUS } else { 0 };
        let _ = downstream.exit_status_request(downstream_channel, status).await;
    }
    let _ = downstream.eof(downstream_channel).await;
    let _ = downstream.close(downstream_channel).await;
    crate::test_hooks::emit!("bridge-exited");
}

async fn handle_downstream_event(upstream: &UpstreamSession, event: Option<DownstreamEvent>) {
    match event {
        Some(DownstreamEvent::Data(bytes)) => {
            if let Err(err) = upstream.channel.data(Cursor::new(bytes)).await {
                warn!(error = %err, "failed to forward data to upstream");
            }
        }
        Some(DownstreamEvent::Resize(pty)) => {
            crate::upstream::relay_window_change(&upstream.channel, pty).await;
        }
        Some(DownstreamEvent::Eof) | None => {
            let _ = upstream.channel.eof().await;
        }
    }
}
