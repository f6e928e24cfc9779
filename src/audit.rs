//! Component B: persists completed shell commands to the audit table.
//!
//! Grounded on `examples/original_source/proxy_session.py`'s `log_cmd`:
//! chunk the command by `MAX_COMMAND_LENGTH` bytes and insert one row per
//! chunk into `volum_ssh_logs`.
//!
//! The §4.B/§6 "one row per ≤MAX_COMMAND_LENGTH chunk, in order" contract is
//! enforced once, at `record_best_effort` below, rather than inside each
//! `AuditSink` impl — `record()` always inserts exactly the unit it is
//! given as a single row, so every sink (the real one and test fakes alike)
//! observes the same chunking instead of having to reimplement it.

use async_trait::async_trait;
use sqlx::MySqlPool;
use tracing::warn;

use crate::error::ProxyError;

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Inserts exactly one row. Callers are responsible for pre-chunking
    /// `command` to `MAX_COMMAND_LENGTH` (see `record_best_effort`).
    async fn record(&self, vm_id: u64, username: &str, command: &str) -> anyhow::Result<()>;
}

pub struct MySqlAuditSink {
    pool: MySqlPool,
}

impl MySqlAuditSink {
    pub fn new(pool: MySqlPool) -> Self {
        MySqlAuditSink { pool }
    }
}

#[async_trait]
impl AuditSink for MySqlAuditSink {
    async fn record(&self, vm_id: u64, username: &str, command: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO volum_ssh_logs(vm_id, username, command) VALUES (?, ?, ?)")
            .bind(vm_id)
            .bind(username)
            .bind(command)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Splits `command` into chunks of at most `max_len` *characters*, never
/// cutting a multi-byte UTF-8 codepoint in half.
fn chunk_command(command: &str, max_len: usize) -> Vec<&str> {
    if max_len == 0 || command.is_empty() {
        return vec![command];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    let bytes_len = command.len();
    let char_indices: Vec<usize> = command.char_indices().map(|(i, _)| i).collect();
    let mut count = 0;
    let mut chunk_start_byte = 0;
    for &idx in &char_indices {
        if count == max_len {
            chunks.push(&command[chunk_start_byte..idx]);
            chunk_start_byte = idx;
            count = 0;
        }
        count += 1;
        start = idx;
    }
    let _ = start;
    chunks.push(&command[chunk_start_byte..bytes_len]);
    chunks
}

/// Chunks `command` to `max_command_length` and records one row per chunk,
/// in order, under the same `(vm_id, username)` tuple (spec §4.B/§6).
/// Each chunk is inserted independently and failures are logged rather than
/// propagated — per the §7 AuditFail policy, the bridge must keep running
/// even if the audit sink is unreachable, and one bad chunk should not stop
/// the rest of the command from being recorded.
pub async fn record_best_effort(
    sink: &dyn AuditSink,
    vm_id: u64,
    username: &str,
    command: &str,
    max_command_length: usize,
) {
    for chunk in chunk_command(command, max_command_length) {
        if let Err(source) = sink.record(vm_id, username, chunk).await {
            let err = ProxyError::AuditFail(source);
            warn!(vm_id, username, error = %err, "failed to record audit command");
        }
    }
}

#[cfg(any(test, feature = "test_hooks"))]
pub mod testing {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedCommand {
        pub vm_id: u64,
        pub username: String,
        pub command: String,
    }

    #[derive(Default)]
    pub struct FakeAuditSink {
        pub records: Mutex<Vec<RecordedCommand>>,
    }

    #[async_trait]
    impl AuditSink for FakeAuditSink {
        async fn record(&self, vm_id: u64, username: &str, command: &str) -> anyhow::Result<()> {
            self.records.lock().await.push(RecordedCommand {
                vm_id,
                username: username.to_string(),
                command: command.to_string(),
            });
            Ok(())
        }
    }
}
