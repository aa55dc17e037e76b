//! Runner configuration.
//!
//! Every tunable value resolves with a three-tier priority:
//!
//! 1. **Override** - value supplied for this call in [`RunOverrides`]
//! 2. **Environment Variable** - value read from the process environment
//! 3. **Default** - built-in default
//!
//! Only transport-level and terminal-size values have environment variables;
//! the completion heuristics are per-call tunables.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 30s | Connection timeout in seconds |
//! | `SSH_COMMAND_TIMEOUT` | 10s | Overall command budget in seconds |
//! | `SSH_MAX_RETRIES` | 1 | Connection retry attempts |
//! | `SSH_RETRY_DELAY_MS` | 500ms | Initial retry delay in milliseconds |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `SSH_POLL_INTERVAL_MS` | 200ms | Terminal polling interval |
//! | `SSH_PTY_COLS` | 200 | Pseudo-terminal width |
//! | `SSH_PTY_ROWS` | 24 | Pseudo-terminal height |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_CHANNEL_OPEN_TIMEOUT_SECS: u64 = 5;
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 1;
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Maximum retry delay cap in seconds
pub(crate) const MAX_RETRY_DELAY_SECS: u64 = 10;

pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
pub(crate) const DEFAULT_MIN_WAIT_MS: u64 = 500;
pub(crate) const DEFAULT_SHORT_STABILITY_MS: u64 = 1000;
pub(crate) const DEFAULT_BONUS_STABILITY_MS: u64 = 3000;
pub(crate) const DEFAULT_SCREEN_STABLE_POLLS: u32 = 3;

/// Five of the seven attainable completion points.
pub(crate) const DEFAULT_REQUIRED_SCORE: u32 = 5;

pub(crate) const DEFAULT_CONTINUATION: &str = " ";
pub(crate) const DEFAULT_PTY_COLS: u32 = 200;
pub(crate) const DEFAULT_PTY_ROWS: u32 = 24;
pub(crate) const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_LOGIN_NUDGE_MS: u64 = 2000;
pub(crate) const DEFAULT_PROMPT_SETTLE_SECS: u64 = 5;

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "SSH_COMMAND_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSH_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub(crate) const POLL_INTERVAL_MS_ENV_VAR: &str = "SSH_POLL_INTERVAL_MS";
pub(crate) const PTY_COLS_ENV_VAR: &str = "SSH_PTY_COLS";
pub(crate) const PTY_ROWS_ENV_VAR: &str = "SSH_PTY_ROWS";

/// Resolve a parsed value with priority: parameter -> env var -> default.
///
/// Unparseable environment values are ignored.
fn resolve_parsed<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> u64 {
    resolve_parsed(timeout_param, CONNECT_TIMEOUT_ENV_VAR, DEFAULT_CONNECT_TIMEOUT_SECS)
}

pub(crate) fn resolve_command_timeout(timeout_param: Option<u64>) -> u64 {
    resolve_parsed(timeout_param, COMMAND_TIMEOUT_ENV_VAR, DEFAULT_COMMAND_TIMEOUT_SECS)
}

pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    resolve_parsed(max_retries_param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

pub(crate) fn resolve_retry_delay_ms(retry_delay_param: Option<u64>) -> u64 {
    resolve_parsed(retry_delay_param, RETRY_DELAY_MS_ENV_VAR, DEFAULT_RETRY_DELAY_MS)
}

pub(crate) fn resolve_poll_interval_ms(poll_param: Option<u64>) -> u64 {
    // A zero interval would spin.
    resolve_parsed(poll_param, POLL_INTERVAL_MS_ENV_VAR, DEFAULT_POLL_INTERVAL_MS).max(1)
}

pub(crate) fn resolve_pty_cols(cols_param: Option<u32>) -> u32 {
    resolve_parsed(cols_param, PTY_COLS_ENV_VAR, DEFAULT_PTY_COLS).max(1)
}

pub(crate) fn resolve_pty_rows(rows_param: Option<u32>) -> u32 {
    resolve_parsed(rows_param, PTY_ROWS_ENV_VAR, DEFAULT_PTY_ROWS).max(1)
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Per-call overrides. Every field is optional; unset fields fall through to
/// the environment and then the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunOverrides {
    /// Overall command budget in seconds
    pub timeout_secs: Option<u64>,
    /// Connection timeout in seconds
    pub connect_timeout_secs: Option<u64>,
    /// Connection retry attempts for transient failures
    pub max_retries: Option<u32>,
    /// Enable zlib compression
    pub compress: Option<bool>,
    /// Terminal polling interval in milliseconds
    pub poll_interval_ms: Option<u64>,
    /// Minimum time before completion may be declared, in milliseconds
    pub min_wait_ms: Option<u64>,
    /// Short output-stability threshold in milliseconds
    pub stability_ms: Option<u64>,
    /// Long output-stability threshold in milliseconds
    pub bonus_stability_ms: Option<u64>,
    /// Consecutive identical screens required for the screen signal
    pub screen_stable_polls: Option<u32>,
    /// Completion score required (maximum attainable is 7)
    pub required_score: Option<u32>,
    /// Keystroke sent to continue a paginated listing
    pub continuation: Option<String>,
    /// Pseudo-terminal width
    pub pty_cols: Option<u32>,
    /// Pseudo-terminal height
    pub pty_rows: Option<u32>,
    /// Send `exit` after the command and treat channel close as completion
    pub append_exit: Option<bool>,
    /// Answer yes/no confirmation prompts with `yes` during shell login
    pub auto_confirm: Option<bool>,
}

/// Resolved settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub channel_open_timeout: Duration,
    /// Bounds the sum of every phase of one command.
    pub command_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub compression: bool,
    pub poll_interval: Duration,
    pub min_wait: Duration,
    pub short_stability: Duration,
    pub bonus_stability: Duration,
    pub screen_stable_polls: u32,
    pub required_score: u32,
    pub continuation: String,
    pub pty_cols: u32,
    pub pty_rows: u32,
    pub login_timeout: Duration,
    pub login_nudge: Duration,
    pub prompt_settle: Duration,
    pub append_exit: bool,
    pub auto_confirm: bool,
}

impl Default for RunnerConfig {
    /// Built-in defaults, ignoring the environment.
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            channel_open_timeout: Duration::from_secs(DEFAULT_CHANNEL_OPEN_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_retry_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
            compression: true,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            min_wait: Duration::from_millis(DEFAULT_MIN_WAIT_MS),
            short_stability: Duration::from_millis(DEFAULT_SHORT_STABILITY_MS),
            bonus_stability: Duration::from_millis(DEFAULT_BONUS_STABILITY_MS),
            screen_stable_polls: DEFAULT_SCREEN_STABLE_POLLS,
            required_score: DEFAULT_REQUIRED_SCORE,
            continuation: DEFAULT_CONTINUATION.to_string(),
            pty_cols: DEFAULT_PTY_COLS,
            pty_rows: DEFAULT_PTY_ROWS,
            login_timeout: Duration::from_secs(DEFAULT_LOGIN_TIMEOUT_SECS),
            login_nudge: Duration::from_millis(DEFAULT_LOGIN_NUDGE_MS),
            prompt_settle: Duration::from_secs(DEFAULT_PROMPT_SETTLE_SECS),
            append_exit: false,
            auto_confirm: false,
        }
    }
}

impl RunnerConfig {
    /// Defaults with environment variables applied.
    pub fn from_env() -> Self {
        Self::resolve(&RunOverrides::default())
    }

    /// Resolve every value from `overrides`, then the environment, then defaults.
    pub fn resolve(overrides: &RunOverrides) -> Self {
        let config = Self {
            connect_timeout: Duration::from_secs(resolve_connect_timeout(
                overrides.connect_timeout_secs,
            )),
            command_timeout: Duration::from_secs(resolve_command_timeout(overrides.timeout_secs)),
            max_retries: resolve_max_retries(overrides.max_retries),
            retry_delay: Duration::from_millis(resolve_retry_delay_ms(None)),
            compression: resolve_compression(overrides.compress),
            poll_interval: Duration::from_millis(resolve_poll_interval_ms(
                overrides.poll_interval_ms,
            )),
            pty_cols: resolve_pty_cols(overrides.pty_cols),
            pty_rows: resolve_pty_rows(overrides.pty_rows),
            ..Self::default()
        };
        config.with_overrides(overrides)
    }

    /// Apply the fields set in `overrides` on top of this configuration.
    pub fn with_overrides(mut self, overrides: &RunOverrides) -> Self {
        if let Some(secs) = overrides.timeout_secs {
            self.command_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = overrides.max_retries {
            self.max_retries = retries;
        }
        if let Some(compress) = overrides.compress {
            self.compression = compress;
        }
        if let Some(ms) = overrides.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = overrides.min_wait_ms {
            self.min_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.stability_ms {
            self.short_stability = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.bonus_stability_ms {
            self.bonus_stability = Duration::from_millis(ms);
        }
        if let Some(polls) = overrides.screen_stable_polls {
            self.screen_stable_polls = polls;
        }
        if let Some(score) = overrides.required_score {
            self.required_score = score;
        }
        if let Some(continuation) = &overrides.continuation {
            self.continuation = continuation.clone();
        }
        if let Some(cols) = overrides.pty_cols {
            self.pty_cols = cols.max(1);
        }
        if let Some(rows) = overrides.pty_rows {
            self.pty_rows = rows.max(1);
        }
        if let Some(append_exit) = overrides.append_exit {
            self.append_exit = append_exit;
        }
        if let Some(auto_confirm) = overrides.auto_confirm {
            self.auto_confirm = auto_confirm;
        }
        self
    }
}
