//! Component C: per-session append-only command log file.
//!
//! Grounded on `examples/original_source/proxy_session.py`'s
//! `setup_session_logging`/`session_logger` pair: one file per session named
//! `logs/ssh_<vm_tag>_<username>_<timestamp>.log`, one line per command in
//! `<ISO-8601> - Command: <line>` form. `vm_tag` is the last dotted
//! component of the target IP (`server.target_ip.split('.')[-1]` in the
//! original), not the VM id. The Python version opens the file eagerly at
//! session start; this opens it lazily on the first shell-mode line so a
//! session that never reaches a shell never creates an empty file.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Last dotted component of `target_ip`, e.g. `"7"` for `"10.0.0.7"` — a
/// non-cryptographic tag, sufficient for human scan (spec §4.C).
pub fn vm_tag(target_ip: &str) -> &str {
    target_ip.rsplit('.').next().unwrap_or(target_ip)
}

pub struct SessionLog {
    dir: PathBuf,
    vm_tag: String,
    username: String,
    file: Option<tokio::fs::File>,
}

impl SessionLog {
    pub fn new(dir: impl Into<PathBuf>, vm_tag: impl Into<String>, username: String) -> Self {
        SessionLog { dir: dir.into(), vm_tag: vm_tag.into(), username, file: None }
    }

    fn file_name(&self) -> String {
        format!(
            "ssh_{}_{}_{}.log",
            self.vm_tag,
            self.username,
            Utc::now().format("%Y%m%d_%H%M%S")
        )
    }

    async fn ensure_open(&mut self) -> anyhow::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).await?;
        let path: &Path = &self.dir.join(self.file_name());
        let file = OpenOptions::new().append(true).create(true).open(path).await?;
        self.file = Some(file);
        Ok(())
    }

    /// Appends one `Command: <line>` entry, opening the file on first use.
    pub async fn record(&mut self, line: &str) -> anyhow::Result<()> {
        self.ensure_open().await?;
        let entry = format!(
            "{} - Command: {}\n",
            Utc::now().to_rfc3339(),
            line
        );
        self.file.as_mut().unwrap().write_all(entry.as_bytes()).await?;
        self.file.as_mut().unwrap().flush().await?;
        Ok(())
    }
}
