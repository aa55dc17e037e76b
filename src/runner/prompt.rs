//! Shell prompt inference.
//!
//! The prompt of a target is unknown until observed. After soliciting a
//! fresh prompt with a bare newline, [`PromptInferer::infer`] picks the line
//! most likely to be the idle prompt:
//!
//! 1. the last line ending in a prompt terminator (`$ # > : ] )`);
//! 2. otherwise the last line whose heuristic score reaches
//!    [`PROMPT_SCORE_THRESHOLD`];
//! 3. otherwise the last non-empty line.
//!
//! Only an entirely blank capture fails with
//! [`RunnerError::PromptNotDetected`].

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::error::RunnerError;
use super::poll::{Deadline, Stability, Step, poll_until, send_within};
use super::terminal::{TerminalBuffer, TerminalInput};

/// Minimum heuristic score for a line to count as a prompt.
pub const PROMPT_SCORE_THRESHOLD: u32 = 3;

/// Lines longer than this are never scored as prompts.
const MAX_PROMPT_LEN: usize = 200;

static TERMINATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[$#>:\])]\s*$").expect("TERMINATOR is a valid pattern"));
static PROMPT_CHAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[#$>:]\s*$").expect("PROMPT_CHAR is a valid pattern"));
static USER_AT_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-zA-Z0-9-]+@[a-zA-Z0-9-]+").expect("USER_AT_HOST is a valid pattern")
});
static BRACKETED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[[a-zA-Z0-9@/~\-\s]+\]").expect("BRACKETED is a valid pattern")
});

/// Stateless prompt guesser.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptInferer;

impl PromptInferer {
    /// Guess the idle prompt from terminal text, trimmed of surrounding whitespace.
    pub fn infer(text: &str) -> Result<String, RunnerError> {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        if let Some(line) = lines.iter().rev().find(|line| TERMINATOR.is_match(line)) {
            return Ok((*line).to_string());
        }
        if let Some(line) = lines.iter().rev().find(|line| Self::is_likely_prompt(line)) {
            return Ok((*line).to_string());
        }
        lines
            .last()
            .map(|line| (*line).to_string())
            .ok_or(RunnerError::PromptNotDetected)
    }

    /// Heuristic score of a single trimmed line.
    ///
    /// | Signal | Points |
    /// |--------|--------|
    /// | contains `@` or an alphanumeric | 2 |
    /// | contains `/`, `\` or `~` | 2 |
    /// | ends in `# $ > :` | 3 |
    /// | `user@host` shape | 2 |
    /// | shorter than 100 characters | 1 |
    /// | bracketed `[user@host dir]` segment | 2 |
    pub fn score(line: &str) -> u32 {
        let mut score = 0;
        if line.contains('@') || line.chars().any(|c| c.is_ascii_alphanumeric()) {
            score += 2;
        }
        if line.contains(['/', '\\', '~']) {
            score += 2;
        }
        if PROMPT_CHAR.is_match(line) {
            score += 3;
        }
        if USER_AT_HOST.is_match(line) {
            score += 2;
        }
        if line.chars().count() < 100 {
            score += 1;
        }
        if BRACKETED.is_match(line) {
            score += 2;
        }
        score
    }

    /// Whether a line plausibly is a prompt, after the length and
    /// punctuation-only guards.
    pub fn is_likely_prompt(line: &str) -> bool {
        let len = line.chars().count();
        if len > MAX_PROMPT_LEN {
            return false;
        }
        if len > 10 && !line.chars().any(|c| c.is_ascii_alphanumeric()) {
            return false;
        }
        Self::score(line) >= PROMPT_SCORE_THRESHOLD
    }
}

/// Poll until the buffer length has been unchanged for `quiet`.
///
/// Returns `false` if the deadline expired first.
pub(crate) async fn wait_for_quiet(
    buffer: &TerminalBuffer,
    input: &dyn TerminalInput,
    interval: Duration,
    quiet: Duration,
    deadline: &Deadline,
) -> Result<bool, RunnerError> {
    let mut stability = Stability::new(buffer.len());
    let settled = poll_until(input, interval, deadline, || {
        if buffer.is_closed() || stability.observe(buffer.len()) >= quiet {
            Step::Done(())
        } else {
            Step::Continue
        }
    })
    .await?;
    Ok(settled.is_some())
}

/// Solicit a fresh prompt and infer it.
///
/// Clears the buffer, sends a bare newline, waits for the echo to settle
/// and infers from the screen projection. The buffer is left holding the
/// solicited prompt; callers reset it before sending a command.
pub async fn detect_prompt(
    buffer: &TerminalBuffer,
    input: &dyn TerminalInput,
    interval: Duration,
    quiet: Duration,
    deadline: &Deadline,
) -> Result<String, RunnerError> {
    buffer.reset();
    send_within(input, b"\n", deadline, interval).await?;
    wait_for_quiet(buffer, input, interval, quiet, deadline).await?;

    let screen = buffer.screen();
    let prompt = PromptInferer::infer(&screen)?;
    debug!(prompt = %prompt, "Detected shell prompt");
    Ok(prompt)
}
