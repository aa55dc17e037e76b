//! Command completion detection.
//!
//! Shells never say "done". After a command is written, the detector polls
//! the terminal buffer and adds up independent signals:
//!
//! | Signal | Points |
//! |--------|--------|
//! | elapsed >= minimum wait | 1 |
//! | any output arrived | 1 |
//! | bytes stable >= short threshold | 2 |
//! | screen identical for N polls | 2 |
//! | bytes stable >= bonus threshold | 1 |
//!
//! Completion is declared once the score reaches the required threshold.
//! Two shortcuts end earlier: the channel closing, and the detected prompt
//! reappearing as the last line once output has been quiet for the short
//! threshold.
//!
//! Pagination is checked before scoring on every tick. A `--More--` style
//! marker on the last screen line is answered with the continuation
//! keystroke, at most once per batch of new output, and that tick does not
//! score. Matching only looks at the screen projection so markers that
//! have scrolled away are never answered again.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::RunnerConfig;
use super::error::RunnerError;
use super::poll::{Deadline, Stability, Step, poll_until};
use super::terminal::{TerminalBuffer, TerminalInput};

/// Highest score the signals can add up to.
pub const MAX_SCORE: u32 = 7;

const MORE_PATTERN: &str = r"<---\s*more\s*--->|--+\s*more\s*--+|more:.*<space>.*quit:.*";

static MORE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!("(?i)({})", MORE_PATTERN)).expect("MORE is a valid pattern")
});
static LEADING_MORE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)^\s*(?:{})\s*", MORE_PATTERN)).expect("LEADING_MORE is a valid pattern")
});

/// Whether a screen line is a pagination marker.
pub fn is_pagination_marker(line: &str) -> bool {
    MORE.is_match(line)
}

/// Remove pagination markers from captured text.
///
/// Only markers that open a line are pager residue. Lines that only held a
/// marker are dropped, output the pager left after its marker is kept, and
/// marker-like text inside a line is output.
pub fn strip_pagination(text: &str) -> String {
    text.split('\n')
        .filter_map(|line| {
            let Some(marker) = LEADING_MORE.find(line) else {
                return Some(line.to_string());
            };
            let rest = line[marker.end()..].trim_end();
            (!rest.is_empty()).then(|| rest.to_string())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Why waiting stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Score,
    PromptReturned,
    ChannelClosed,
    Timeout,
}

/// Captured output and how the wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub reason: CompletionReason,
    /// Continuation keystrokes sent for pagination.
    pub continuations: usize,
}

impl Completion {
    pub fn timed_out(&self) -> bool {
        self.reason == CompletionReason::Timeout
    }
}

/// Observations scored on one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    pub elapsed: Duration,
    pub has_content: bool,
    pub stable_for: Duration,
    pub identical_screens: u32,
}

/// Weighted-signal completion detector for one command.
#[derive(Debug, Clone)]
pub struct CommandCompletionDetector {
    prompt: Option<String>,
    poll_interval: Duration,
    min_wait: Duration,
    short_stability: Duration,
    bonus_stability: Duration,
    screen_stable_polls: u32,
    required_score: u32,
    continuation: Vec<u8>,
}

impl CommandCompletionDetector {
    pub fn new(config: &RunnerConfig, prompt: Option<String>) -> Self {
        Self {
            prompt: prompt.filter(|p| !p.trim().is_empty()),
            poll_interval: config.poll_interval,
            min_wait: config.min_wait,
            short_stability: config.short_stability,
            bonus_stability: config.bonus_stability,
            screen_stable_polls: config.screen_stable_polls,
            required_score: config.required_score.min(MAX_SCORE),
            continuation: config.continuation.as_bytes().to_vec(),
        }
    }

    pub fn score(&self, signals: &Signals) -> u32 {
        let mut score = 0;
        if signals.elapsed >= self.min_wait {
            score += 1;
        }
        if signals.has_content {
            score += 1;
        }
        if signals.stable_for >= self.short_stability {
            score += 2;
        }
        if signals.identical_screens >= self.screen_stable_polls {
            score += 2;
        }
        if signals.stable_for >= self.bonus_stability {
            score += 1;
        }
        score
    }

    /// Poll until the command's output is complete or `deadline` expires.
    ///
    /// Expiry is not an error: the text captured so far is returned with
    /// [`CompletionReason::Timeout`].
    pub async fn wait(
        &self,
        buffer: &TerminalBuffer,
        input: &dyn TerminalInput,
        deadline: &Deadline,
    ) -> Result<Completion, RunnerError> {
        let started = Instant::now();
        let mut stability = Stability::new(buffer.len());
        let mut last_screen = String::new();
        let mut identical_screens = 0u32;
        let mut continued_at: Option<usize> = None;
        let mut continuations = 0usize;

        let reason = poll_until(input, self.poll_interval, deadline, || {
            let len = buffer.len();
            let stable_for = stability.observe(len);
            let screen = buffer.screen();
            if screen == last_screen {
                identical_screens += 1;
            } else {
                identical_screens = 0;
                last_screen = screen;
            }

            let last_line = last_screen
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty());

            if let Some(line) = last_line
                && is_pagination_marker(line)
                && continued_at.is_none_or(|at| len > at)
            {
                continued_at = Some(len);
                continuations += 1;
                stability.restart(len);
                identical_screens = 0;
                debug!(continuations, "Pagination marker, continuing");
                return Step::Send(self.continuation.clone());
            }

            if buffer.is_closed() {
                return Step::Done(CompletionReason::ChannelClosed);
            }

            if let (Some(prompt), Some(line)) = (&self.prompt, last_line)
                && len > 0
                && line == prompt.trim()
                && stable_for >= self.short_stability
            {
                return Step::Done(CompletionReason::PromptReturned);
            }

            let signals = Signals {
                elapsed: started.elapsed(),
                has_content: len > 0,
                stable_for,
                identical_screens,
            };
            if self.score(&signals) >= self.required_score {
                return Step::Done(CompletionReason::Score);
            }
            Step::Continue
        })
        .await?;

        let reason = reason.unwrap_or_else(|| {
            warn!(elapsed = ?started.elapsed(), "Command did not complete before the deadline");
            CompletionReason::Timeout
        });
        debug!(?reason, continuations, "Completion detected");

        Ok(Completion {
            text: strip_pagination(&buffer.text()),
            reason,
            continuations,
        })
    }
}
