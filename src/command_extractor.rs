//! Component H: turns a raw shell-mode keystroke byte stream into completed
//! command lines, exactly as `examples/original_source/proxy_session.py`'s
//! `forward_to_target` closure does it. Pure and synchronous: no I/O, called
//! inline from the downstream `data` callback.

/// Accumulates undecoded keystrokes for one shell-mode channel and yields
/// completed, non-empty, trimmed lines as they appear.
#[derive(Default)]
pub struct CommandExtractor {
    buffer: String,
}

impl CommandExtractor {
    pub fn new() -> Self {
        CommandExtractor::default()
    }

    /// Feeds raw bytes as observed on the wire, in order. Bytes that are not
    /// valid UTF-8 are silently dropped from the accumulator (they are
    /// still forwarded upstream unchanged by the caller) rather than
    /// aborting extraction, matching the original's `UnicodeDecodeError:
    /// pass`.
    ///
    /// Returns the command lines newly completed by this chunk, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let text = match std::str::from_utf8(data) {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        };

        let mut completed = Vec::new();
        for ch in text.chars() {
            if ch == '\u{3}' {
                // Ctrl-C: discard whatever has been typed so far.
                self.buffer.clear();
                continue;
            }

            if ch == '\n' || ch == '\r' {
                let flushed = std::mem::take(&mut self.buffer);
                for line in flushed.replace('\r', "\n").split('\n') {
                    let line = line.trim();
                    if !line.is_empty() {
                        completed.push(line.to_string());
                    }
                }
                continue;
            }

            self.buffer.push(ch);
        }
        completed
    }
}
