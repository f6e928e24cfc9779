//! Typed errors at the points where spec §7's policy table actually
//! branches (auth accept/reject, upstream dial, bridge teardown, session
//! timeout). Plumbing below those boundaries keeps using `anyhow` in the
//! teacher's style; these variants exist to give each policy decision a
//! structured, greppable log line rather than an ad hoc string, even where
//! (as with `AuthReject`/`NegotiationFail`/`SessionTimeout`) the call site
//! doesn't propagate the error as a `Result` — it constructs one purely to
//! log it with `tracing`'s `%err` formatting.
//!
//! §7's "ResolverFail is treated as AuthReject" policy has no separate code
//! path to model: `downstream.rs::auth_password` already denies on both a
//! resolver error and a plain not-found the same way, by falling through to
//! `Auth::reject()` regardless of which `ProxyError` variant it logged.

use thiserror::Error;

/// One variant per row of spec §7's error-kind table.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("downstream auth rejected: {0}")]
    AuthReject(String),

    #[error("upstream dial failed: {0}")]
    UpstreamDialFail(#[source] anyhow::Error),

    #[error("downstream SSH negotiation failed: {0}")]
    NegotiationFail(#[source] anyhow::Error),

    #[error("session timed out waiting for shell/exec/subsystem request")]
    SessionTimeout,

    #[error("bridge I/O error: {0}")]
    BridgeIo(#[source] anyhow::Error),

    #[error("audit sink unavailable: {0}")]
    AuditFail(#[source] anyhow::Error),

    #[error("directory resolver unavailable: {0}")]
    ResolverFail(#[source] anyhow::Error),
}
