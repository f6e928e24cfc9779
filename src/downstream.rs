//! Component D: the downstream `russh::server::Handler` adapter.
//!
//! Grounded on `examples/other_examples/.../antrusd-sockrats/handler.rs`
//! (callback shapes, `session.handle()`/`channel_success`/`channel_failure`
//! conventions) and on `examples/original_source/proxy.py`'s
//! `check_auth_password` for the username-split/resolve algorithm this
//! module's `auth_password` reproduces exactly.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::audit::AuditSink;
use crate::command_extractor::CommandExtractor;
use crate::consts::AWAIT_SESSION_TIMEOUT;
use crate::directory::DirectoryResolver;
use crate::error::ProxyError;
use crate::session_log::SessionLog;
use crate::session_request::{DownstreamEvent, Mode, PtyRequest, RedactedSecret, SessionState, TargetVm};
use crate::supervisor;

/// Per-connection handle factory, cloned once per accepted TCP connection.
pub struct ProxyServer {
    pub directory: Arc<dyn DirectoryResolver>,
    pub audit: Arc<dyn AuditSink>,
    pub log_dir: String,
    pub target_ssh_port: u16,
    pub max_command_length: usize,
}

impl russh::server::Server for ProxyServer {
    type Handler = DownstreamHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(?peer_addr, "accepted downstream connection");
        DownstreamHandler {
            peer_addr,
            directory: self.directory.clone(),
            audit: self.audit.clone(),
            log_dir: self.log_dir.clone(),
            target_ssh_port: self.target_ssh_port,
            max_command_length: self.max_command_length,
            state: None,
            bridge_tx: None,
            channel_id: None,
            extractor: CommandExtractor::new(),
            session_log: None,
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        let err = ProxyError::NegotiationFail(error.into());
        warn!(error = %err, "session ended with error");
    }
}

pub struct DownstreamHandler {
    peer_addr: Option<SocketAddr>,
    directory: Arc<dyn DirectoryResolver>,
    audit: Arc<dyn AuditSink>,
    log_dir: String,
    target_ssh_port: u16,
    max_command_length: usize,
    state: Option<Arc<SessionState>>,
    /// Held between `auth_password` and the first shell/exec/subsystem
    /// request, where it is handed off to the supervisor task.
    bridge_tx: Option<watch::Sender<Option<mpsc::UnboundedSender<DownstreamEvent>>>>,
    channel_id: Option<ChannelId>,
    extractor: CommandExtractor,
    session_log: Option<SessionLog>,
}

/// Splits `vm_id-real_username` the same way
/// `examples/original_source/proxy.py`'s `check_auth_password` does: split
/// on the *first* `-` only, and require the prefix to parse as an integer.
fn split_username(username: &str) -> Option<(u64, String)> {
    let (vm_id, real_username) = username.split_once('-')?;
    let vm_id: u64 = vm_id.parse().ok()?;
    Some((vm_id, real_username.to_string()))
}

#[async_trait]
impl Handler for DownstreamHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let Some((vm_id, real_username)) = split_username(user) else {
            let err = ProxyError::AuthReject(format!("malformed username {:?}", user));
            warn!(error = %err, "rejecting downstream authentication");
            return Ok(Auth::reject());
        };

        // §7: ResolverFail is treated the same as AuthReject (safer: deny)
        // — there is no separate code path, just a different logged reason.
        let resolved = match self.directory.resolve(vm_id).await {
            Ok(resolved) => resolved,
            Err(err) => {
                let err = ProxyError::ResolverFail(err);
                error!(vm_id, error = %err, "denying auth");
                return Ok(Auth::reject());
            }
        };

        let Some(internal_ip) = resolved else {
            let err = ProxyError::AuthReject(format!("no such vm {}", vm_id));
            warn!(error = %err, "rejecting downstream authentication");
            return Ok(Auth::reject());
        };

        info!(vm_id, username = real_username, peer = ?self.peer_addr, "accepted downstream authentication");
        crate::test_hooks::emit!("downstream-auth-accepted");

        let target = TargetVm { vm_id, internal_ip };
        let (state, bridge_tx) = SessionState::new(
            real_username,
            target,
            RedactedSecret::new(password.to_string()),
        );
        self.bridge_tx = Some(bridge_tx);
        self.state = Some(state);

        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.channel_id.is_some() {
            warn!("rejecting second session channel on one connection");
            return Ok(false);
        }
        let channel_id = channel.id();
        self.channel_id = Some(channel_id);

        // `AWAIT_SESSION`: a client that authenticates, opens the session
        // channel, but never requests a shell/exec/subsystem must not hold
        // the connection open forever (spec §4.D state machine). Spawned
        // here rather than from the supervisor because the supervisor task
        // itself is only ever started once that request has already
        // arrived.
        if let Some(state) = self.state.clone() {
            let handle = session.handle();
            tokio::spawn(async move {
                if tokio::time::timeout(AWAIT_SESSION_TIMEOUT, state.wait_for_session_ready())
                    .await
                    .is_err()
                {
                    let err = ProxyError::SessionTimeout;
                    warn!(error = %err, "closing connection");
                    let _ = handle.close(channel_id).await;
                }
            });
        }
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = &self.state {
            let mut pty = state.pty.lock().await;
            *pty = Some(PtyRequest { term: term.to_string(), width: col_width, height: row_height });
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = &self.state {
            let pty = {
                let mut guard = state.pty.lock().await;
                let term = guard.as_ref().map(|p| p.term.clone()).unwrap_or_else(|| "xterm".to_string());
                let pty = PtyRequest { term, width: col_width, height: row_height };
                *guard = Some(pty.clone());
                pty
            };
            if let Some(tx) = state.wait_for_bridge().await {
                let _ = tx.send(DownstreamEvent::Resize(pty));
            }
        }
        let _ = channel;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.begin_session(channel, session, Mode::Shell).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.begin_session(channel, session, Mode::Exec(data.to_vec())).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.begin_session(channel, session, Mode::Subsystem(name.to_string())).await
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let Some(state) = self.state.clone() else {
            session.close(channel);
            return Ok(());
        };

        let Some(tx) = state.wait_for_bridge().await else {
            session.close(channel);
            return Ok(());
        };

        if matches!(state.mode.get(), Some(Mode::Shell)) {
            for line in self.extractor.feed(data) {
                crate::audit::record_best_effort(
                    self.audit.as_ref(),
                    state.target.vm_id,
                    &state.username,
                    &line,
                    self.max_command_length,
                )
                .await;
                if self.session_log.is_none() {
                    let vm_tag = crate::session_log::vm_tag(&state.target.internal_ip).to_string();
                    self.session_log = Some(SessionLog::new(self.log_dir.clone(), vm_tag, state.username.clone()));
                }
                if let Err(err) = self.session_log.as_mut().unwrap().record(&line).await {
                    warn!(error = %err, "failed to append to session log file");
                }
            }
        }

        let _ = tx.send(DownstreamEvent::Data(data.to_vec()));
        Ok(())
    }

    async fn channel_eof(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = &self.state {
            if let Some(tx) = state.wait_for_bridge().await {
                let _ = tx.send(DownstreamEvent::Eof);
            }
        }
        Ok(())
    }
}

impl DownstreamHandler {
    /// Common path for shell/exec/subsystem requests: records the mode
    /// (rejecting a second request on the same session per spec ordering),
    /// and if this is the first request, spawns the supervisor task that
    /// dials upstream and drives the bridge for the rest of the session.
    async fn begin_session(&mut self, channel: ChannelId, session: &mut Session, mode: Mode) -> Result<(), russh::Error> {
        let Some(state) = self.state.clone() else {
            session.channel_failure(channel)?;
            return Ok(());
        };

        if !state.set_mode(mode) {
            warn!("rejecting duplicate session request on channel");
            session.channel_failure(channel)?;
            return Ok(());
        }

        session.channel_success(channel)?;
        crate::test_hooks::emit!("session-ready");

        let handle = session.handle();
        if let Some(bridge_tx) = self.bridge_tx.take() {
            supervisor::spawn(state, handle, channel, self.target_ssh_port, bridge_tx);
        }
        Ok(())
    }
}
