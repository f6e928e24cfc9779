use std::time::Duration;

/// How long the downstream side gets to request a shell, exec, or subsystem
/// after authenticating before the supervisor gives up and tears the
/// connection down (spec §4.D / §4.H state machine, `AWAIT_SESSION`).
pub const AWAIT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream dial timeout for interactive shells.
pub const UPSTREAM_DIAL_TIMEOUT_SHELL: Duration = Duration::from_secs(30);

/// Upstream dial timeout for exec/subsystem (file-transfer-shaped) sessions.
pub const UPSTREAM_DIAL_TIMEOUT_FILE_TRANSFER: Duration = Duration::from_secs(10);

/// Keepalive interval advertised to downstream clients.
pub const DOWNSTREAM_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Default `MAX_COMMAND_LENGTH` (bytes per audit record chunk) when the
/// config file does not override it.
pub const DEFAULT_MAX_COMMAND_LENGTH: usize = 10_000;

/// Exit status sent downstream when the bridge aborts on an I/O error before
/// an upstream exit status was ever received.
pub const FALLBACK_EXIT_STATUS: u32 = 1;

/// How long the U→C pump waits for a trailing upstream exit status once it
/// has observed EOF, before giving up and sending the fallback status.
pub const EXIT_STATUS_GRACE_PERIOD: Duration = Duration::from_secs(5);
