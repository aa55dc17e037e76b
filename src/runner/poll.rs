//! Bounded polling shared by prompt detection, login sequencing and
//! completion detection.
//!
//! Target shells give no "idle" notification, so every detector observes the
//! [`TerminalBuffer`](super::terminal::TerminalBuffer) on a fixed interval.
//! [`poll_until`] owns that loop: it calls a synchronous tick closure, writes
//! whatever keystrokes the tick asks for, and stops once the tick is done or
//! the [`Deadline`] expires. Suspension only happens at the sleep and at the
//! write, never while the buffer lock is held.

use std::time::Duration;

use tokio::time::Instant;

use super::error::RunnerError;
use super::terminal::TerminalInput;

/// Absolute end of a time budget.
///
/// Nested phases derive their own timeouts with [`Deadline::clamp`] so an
/// inner timeout never exceeds what remains of the outer budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    end: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        let start = Instant::now();
        Self {
            start,
            end: start + budget,
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.end
    }

    /// Time since the budget started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// `inner` capped to the remaining budget.
    pub fn clamp(&self, inner: Duration) -> Duration {
        inner.min(self.remaining())
    }

    /// A child deadline ending after `inner` or at this deadline, whichever is first.
    pub fn child(&self, inner: Duration) -> Deadline {
        Deadline::after(self.clamp(inner))
    }
}

/// Tracks how long an observed length has stayed unchanged.
#[derive(Debug, Clone, Copy)]
pub struct Stability {
    last_len: usize,
    since: Instant,
}

impl Stability {
    pub fn new(len: usize) -> Self {
        Self {
            last_len: len,
            since: Instant::now(),
        }
    }

    /// Record the current length and return how long it has been stable.
    pub fn observe(&mut self, len: usize) -> Duration {
        if len != self.last_len {
            self.restart(len);
        }
        self.since.elapsed()
    }

    /// Start counting again from now.
    pub fn restart(&mut self, len: usize) {
        self.last_len = len;
        self.since = Instant::now();
    }
}

/// What a tick decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// Nothing to do yet; sleep one interval.
    Continue,
    /// Write these bytes to the terminal, then sleep one interval.
    Send(Vec<u8>),
    /// Stop polling with this value.
    Done(T),
}

/// Write `data`, giving up once the deadline plus `slack` has passed.
///
/// A peer that stops reading would otherwise stall the write forever.
pub async fn send_within(
    input: &dyn TerminalInput,
    data: &[u8],
    deadline: &Deadline,
    slack: Duration,
) -> Result<(), RunnerError> {
    let budget = deadline.remaining() + slack;
    tokio::time::timeout(budget, input.send(data))
        .await
        .map_err(|_| RunnerError::ChannelIo(format!("write stalled for {:?}", budget)))?
}

/// Poll `tick` every `interval` until it returns [`Step::Done`] or the
/// deadline expires.
///
/// Returns `Ok(None)` on expiry. The tick runs once more right after the
/// deadline passes, so total latency is bounded by the deadline plus one
/// interval. Write failures abort with [`RunnerError::ChannelIo`].
pub async fn poll_until<T>(
    input: &dyn TerminalInput,
    interval: Duration,
    deadline: &Deadline,
    mut tick: impl FnMut() -> Step<T>,
) -> Result<Option<T>, RunnerError> {
    loop {
        match tick() {
            Step::Done(value) => return Ok(Some(value)),
            Step::Send(data) => send_within(input, &data, deadline, interval).await?,
            Step::Continue => {}
        }

        if deadline.is_expired() {
            return Ok(None);
        }
        tokio::time::sleep(deadline.clamp(interval)).await;
    }
}
