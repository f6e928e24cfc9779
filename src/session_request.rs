//! Shared data model for a single downstream connection: the mode the
//! client eventually asks for (shell/exec/subsystem), its PTY metadata, and
//! the redacted password newtype. One `SessionRequest` per connection, set
//! exactly once.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, OnceCell};

/// What the downstream side asked the proxy to do once it opened a channel.
/// Exactly one of these is ever recorded per session (spec §3 ordering rule:
/// a second shell/exec/subsystem request on the same session is rejected).
#[derive(Debug, Clone)]
pub enum Mode {
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
}

/// PTY metadata as requested by `pty-req` and resized by `window-change`.
/// `term` is only ever set by `pty-req` — `window-change` carries no
/// terminal-type field, so it updates `width`/`height` in place and leaves
/// `term` untouched.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub width: u32,
    pub height: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        PtyRequest { term: "xterm".to_string(), width: 80, height: 24 }
    }
}

/// A password that never appears in a log line. `Debug` and `Display` both
/// print a fixed placeholder; only `expose()` gets at the real bytes, and
/// every call site that does so is a deliberate auth check, not a log call.
#[derive(Clone)]
pub struct RedactedSecret(String);

impl RedactedSecret {
    pub fn new(value: String) -> Self {
        RedactedSecret(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RedactedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RedactedSecret(\"***\")")
    }
}

impl fmt::Display for RedactedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// The resolved identity of a tenant VM, produced by the directory resolver
/// and carried alongside the session for audit/log tagging.
#[derive(Debug, Clone)]
pub struct TargetVm {
    pub vm_id: u64,
    pub internal_ip: String,
}

/// A C→U event, tapped and (for shell mode) extracted in the downstream
/// `data`/`window_change_request`/`channel_eof` callbacks, then handed to
/// the bridge task that owns the upstream channel and performs the actual
/// write (see `bridge.rs`).
#[derive(Debug)]
pub enum DownstreamEvent {
    Data(Vec<u8>),
    Resize(PtyRequest),
    Eof,
}

/// Per-connection state shared between the `russh::server::Handler`
/// callbacks and the supervisor task that drives upstream dial + bridging.
///
/// `mode` is written exactly once via `OnceCell::set`; a second attempt
/// returns `Err` to the caller, which the handler turns into a channel
/// failure rather than silently overwriting the first request.
pub struct SessionState {
    pub username: String,
    pub target: TargetVm,
    pub password: RedactedSecret,
    pub mode: OnceCell<Mode>,
    pub pty: Mutex<Option<PtyRequest>>,
    /// Flipped to `true` the first time `mode` is set, so a waiter started
    /// either before or after that happens observes the same outcome. A
    /// `watch` channel is used instead of a one-shot `Notify` for the same
    /// reason as `bridge_tx` below: `Notify::notify_waiters` only wakes
    /// waiters already registered at the moment it fires, and the
    /// supervisor task that awaits this is spawned from inside the very
    /// callback that sets the mode, so it would register its waiter after
    /// the notification already happened and miss it.
    session_ready: watch::Receiver<bool>,
    ready_tx: watch::Sender<bool>,
    /// Published once the supervisor has dialed upstream and the bridge
    /// task is ready to accept C→U events (or has given up for good, in
    /// which case it stays `None` and the watch channel is simply dropped
    /// by the supervisor, closing `changed()` for any waiter). A `watch`
    /// channel is used instead of a one-shot `Notify` so a handler callback
    /// that starts waiting *after* the bridge became ready still observes
    /// the current value instead of missing the wakeup.
    bridge_tx: watch::Receiver<Option<mpsc::UnboundedSender<DownstreamEvent>>>,
}

impl SessionState {
    pub fn new(
        username: String,
        target: TargetVm,
        password: RedactedSecret,
    ) -> (Arc<Self>, watch::Sender<Option<mpsc::UnboundedSender<DownstreamEvent>>>) {
        let (bridge_tx, bridge_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = watch::channel(false);
        let state = Arc::new(SessionState {
            username,
            target,
            password,
            mode: OnceCell::new(),
            pty: Mutex::new(None),
            session_ready: ready_rx,
            ready_tx,
            bridge_tx: bridge_rx,
        });
        (state, bridge_tx)
    }

    /// Records the session mode if none has been set yet. Returns `false`
    /// if a mode was already recorded, so the caller can reject the
    /// duplicate request instead of clobbering the first one.
    pub fn set_mode(&self, mode: Mode) -> bool {
        if self.mode.set(mode).is_ok() {
            let _ = self.ready_tx.send(true);
            true
        } else {
            false
        }
    }

    /// Waits until a shell/exec/subsystem request has set `mode`. Returns
    /// immediately if one already has been recorded — covers both
    /// orderings between this call and `set_mode` (see the field doc on
    /// `session_ready`).
    pub async fn wait_for_session_ready(&self) {
        let mut rx = self.session_ready.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Waits until the bridge is ready (or has permanently failed to come
    /// up) and returns a sender for C→U events, if any.
    pub async fn wait_for_bridge(&self) -> Option<mpsc::UnboundedSender<DownstreamEvent>> {
        let mut rx = self.bridge_tx.clone();
        loop {
            if let Some(tx) = rx.borrow().as_ref() {
                return Some(tx.clone());
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}
