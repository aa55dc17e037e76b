//! Terminal I/O for one shell channel: the shared output buffer and the
//! input seam keystrokes are written through.
//!
//! The channel reader task appends bytes while the driving task polls for
//! prompts, login challenges and completion. All access goes through one
//! `std::sync::Mutex` held only for the duration of a copy, never across an
//! `.await`.
//!
//! Two views are kept:
//!
//! - the raw byte count since the last [`reset`](TerminalBuffer::reset), used
//!   for byte-level stability tracking;
//! - the filtered text (control sequences stripped, not yet cooked) from
//!   which both the full capture and the bounded "screen" projection are
//!   rendered.
//!
//! The screen projection only cooks the last [`TAIL_WINDOW`] bytes, so
//! matching cost stays bounded no matter how much output accumulates.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::ansi::{ControlSequenceFilter, cook};
use super::error::RunnerError;

/// Maximum number of filtered bytes scanned when rendering the screen.
pub const TAIL_WINDOW: usize = 8192;

/// Write side of an interactive terminal.
///
/// Implemented by the PTY channel writer; tests substitute scripted devices.
#[async_trait]
pub trait TerminalInput: Send + Sync {
    /// Send raw bytes (text, keystrokes) to the remote terminal.
    async fn send(&self, data: &[u8]) -> Result<(), RunnerError>;

    /// Send `line` followed by a newline.
    async fn send_line(&self, line: &str) -> Result<(), RunnerError> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.send(&data).await
    }
}

#[derive(Debug, Default)]
struct Inner {
    filter: ControlSequenceFilter,
    raw_len: usize,
    filtered: Vec<u8>,
    closed: bool,
}

/// Cloneable handle to a shared terminal buffer.
#[derive(Debug, Clone)]
pub struct TerminalBuffer {
    inner: Arc<Mutex<Inner>>,
    screen_rows: usize,
}

impl TerminalBuffer {
    /// Create an empty buffer whose screen projection shows `screen_rows` lines.
    pub fn new(screen_rows: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            screen_rows: screen_rows.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another task panicked mid-append; the
        // byte vectors are still structurally valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a chunk received from the channel.
    pub fn append(&self, data: &[u8]) {
        let mut inner = self.lock();
        inner.raw_len += data.len();
        let Inner {
            filter, filtered, ..
        } = &mut *inner;
        filter.feed(data, filtered);
    }

    /// Mark the underlying channel as closed (EOF, close, or reader error).
    pub fn mark_closed(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Raw bytes received since the last reset.
    pub fn len(&self) -> usize {
        self.lock().raw_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything captured so far so later reads see only new output.
    ///
    /// Filter state survives, so an escape sequence straddling the reset is
    /// still stripped.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.raw_len = 0;
        inner.filtered.clear();
    }

    /// Full cooked text captured since the last reset.
    pub fn text(&self) -> String {
        let filtered = self.lock().filtered.clone();
        cook(&String::from_utf8_lossy(&filtered))
    }

    /// Position in the filtered text, for a later [`text_since`](Self::text_since).
    pub fn mark(&self) -> usize {
        self.lock().filtered.len()
    }

    /// Cooked text received after `mark`, limited to the tail window.
    pub fn text_since(&self, mark: usize) -> String {
        let tail = {
            let inner = self.lock();
            let len = inner.filtered.len();
            let start = mark.min(len).max(len.saturating_sub(TAIL_WINDOW));
            inner.filtered[start..].to_vec()
        };
        cook(&String::from_utf8_lossy(&tail))
    }

    /// Cooked projection of the last `screen_rows` lines of the tail window.
    pub fn screen(&self) -> String {
        let tail = {
            let inner = self.lock();
            let start = inner.filtered.len().saturating_sub(TAIL_WINDOW);
            inner.filtered[start..].to_vec()
        };
        let cooked = cook(&String::from_utf8_lossy(&tail));
        let lines: Vec<&str> = cooked.split('\n').collect();
        let start = lines.len().saturating_sub(self.screen_rows);
        lines[start..].join("\n")
    }

    /// Last non-blank line of the screen projection, trimmed.
    pub fn last_line(&self) -> Option<String> {
        self.screen()
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}
