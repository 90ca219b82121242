//! Progress text from the filter stage.
//!
//! `pv` rewrites one status line in place, so updates are separated by `\r`
//! and a read may end halfway through one. [`ProgressBuffer`] rebuilds whole
//! lines from those chunks.

use std::time::Duration;

/// Reassembles carriage-return separated status lines from raw chunks.
#[derive(Debug, Default)]
pub struct ProgressBuffer {
    pending: Vec<u8>,
}

impl ProgressBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk. Returns the newest complete line in it, if any; an
    /// unterminated tail is kept for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(chunk);

        let end = self.pending.iter().rposition(|b| is_terminator(*b))?;
        let complete: Vec<u8> = self.pending.drain(..=end).collect();

        complete
            .split(|b| is_terminator(*b))
            .filter(|line| !line.is_empty())
            .last()
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

fn is_terminator(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

/// Format duration as human-readable string
pub fn format_duration(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
