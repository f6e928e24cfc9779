//! An in-process event bus that lets integration tests block on a
//! deterministic lifecycle event ("session-ready fired", "bridge exited")
//! instead of sleeping. Ported from the teacher's unix-socket test-hook
//! server (which let an external test *process* dial in); this crate's
//! integration tests run the proxy in the same process as the test, so a
//! broadcast channel behind the `test_hooks` feature is all that's needed.

use once_cell::sync::Lazy;
use tokio::sync::broadcast;

#[cfg(feature = "test_hooks")]
#[macro_export]
macro_rules! emit {
    ($e:expr) => {
        $crate::test_hooks::emit_event_impl($e);
    };
}

#[cfg(not(feature = "test_hooks"))]
#[macro_export]
macro_rules! emit {
    ($e:expr) => {}; // no-op
}

pub(crate) use emit;

const CHANNEL_CAPACITY: usize = 256;

static BUS: Lazy<broadcast::Sender<String>> = Lazy::new(|| broadcast::channel(CHANNEL_CAPACITY).0);

pub fn emit_event_impl(event: &str) {
    tracing::trace!(event, "test hook event");
    // No receivers is the common case outside of tests; broadcast::send
    // failing just means nobody is listening right now.
    let _ = BUS.send(event.to_string());
}

/// Subscribes to the bus, then blocks until `event` is observed or `timeout`
/// elapses. The subscription happens before the caller does whatever might
/// trigger the event, so a `wait_for` call never races past an emission
/// that occurred before it — callers are expected to call `subscribe()`
/// first if an event might fire before they can call `wait_for`.
pub fn subscribe() -> broadcast::Receiver<String> {
    BUS.subscribe()
}

/// Drains `rx` until `event` is observed or `timeout` elapses.
pub async fn wait_for(mut rx: broadcast::Receiver<String>, event: &str, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(seen)) if seen == event => return true,
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => return false,
            Err(_) => return false,
        }
    }
}
