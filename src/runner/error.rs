//! Error taxonomy for remote command execution.
//!
//! Runners never surface environmental failures as panics. Transport and
//! channel failures are carried as [`RunnerError`] values up to the runner
//! boundary, where they are folded into a failed
//! [`CommandResult`](super::types::CommandResult) so the race executor can
//! still deliver the other strategy's output.
//!
//! # Retry classification
//!
//! Connection attempts are retried with backoff only for transient transport
//! failures. Authentication failures take precedence and are never retried,
//! to avoid repeatedly failing with bad credentials or locking accounts.
//!
//! ```rust,ignore
//! assert!(!is_retryable_error("Permission denied"));
//! assert!(is_retryable_error("Connection refused"));
//! assert!(!is_retryable_error("SSH protocol error"));
//! assert!(is_retryable_error("SSH connection timeout"));
//! ```

use std::time::Duration;

use thiserror::Error;

/// Authentication failure patterns (case-insensitive).
///
/// These never succeed on retry and fail immediately.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Transient transport failure patterns (case-insensitive).
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "timed out",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

/// Errors produced while connecting to a target or driving one of its channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    /// Transport unreachable, refused, or the handshake failed.
    #[error("connection to {username}@{host}:{port} failed: {reason}")]
    Connection {
        host: String,
        port: u16,
        username: String,
        reason: String,
    },

    /// Credential rejected by the transport or by a shell-level login.
    #[error("authentication for {username}@{host}:{port} failed: {reason}")]
    Authentication {
        host: String,
        port: u16,
        username: String,
        reason: String,
    },

    /// The server refused a channel, PTY, shell or exec request.
    #[error("channel request rejected: {0}")]
    ChannelOpen(String),

    /// Reading from or writing to an open channel failed.
    #[error("channel I/O failed: {0}")]
    ChannelIo(String),

    /// No definitive completion signal arrived within the budget.
    #[error("command did not complete within {0:?}")]
    CommandTimeout(Duration),

    /// The terminal never printed anything a prompt could be inferred from.
    #[error("no shell prompt could be detected")]
    PromptNotDetected,

    /// A shell-level login challenge did not resolve within its timeout.
    #[error("shell login did not complete within {0:?}")]
    LoginTimeout(Duration),

    /// A shell-level login challenge reported a failure marker.
    #[error("shell login rejected: {0}")]
    LoginRejected(String),

    /// Caller contract violation (empty command, missing host, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RunnerError {
    /// Whether retrying the connection attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunnerError::Connection { reason, .. } => is_retryable_error(reason),
            _ => false,
        }
    }

    /// Whether this error is an authentication failure at any level.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            RunnerError::Authentication { .. } | RunnerError::LoginRejected(_)
        )
    }
}

/// Classify a raw transport error message as transient or permanent.
///
/// 1. Messages matching an authentication pattern are never retryable.
/// 2. Messages matching a transient connection pattern are retryable.
/// 3. Anything else is retried unless it looks like an SSH protocol error
///    that does not also mention a timeout or a connect failure.
pub fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return true;
    }

    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(reason: &str) -> RunnerError {
        RunnerError::Connection {
            host: "10.0.0.1".to_string(),
            port: 22,
            username: "admin".to_string(),
            reason: reason.to_string(),
        }
    }

    mod classification {
        use super::*;

        #[test]
        fn test_auth_errors_not_retryable() {
            assert!(!is_retryable_error("Authentication failed"));
            assert!(!is_retryable_error("PERMISSION DENIED"));
            assert!(!is_retryable_error("publickey rejected"));
        }

        #[test]
        fn test_transport_errors_retryable() {
            assert!(is_retryable_error("Connection refused"));
            assert!(is_retryable_error("Network is unreachable"));
            assert!(is_retryable_error("Broken pipe"));
            assert!(is_retryable_error("connect timed out after 30s"));
        }

        #[test]
        fn test_auth_takes_priority_over_transport() {
            assert!(!is_retryable_error(
                "Connection timeout during authentication failed"
            ));
        }

        #[test]
        fn test_ssh_protocol_errors_not_retryable() {
            assert!(!is_retryable_error("SSH protocol error"));
            assert!(is_retryable_error("SSH connection timeout"));
        }

        #[test]
        fn test_unknown_errors_retryable() {
            assert!(is_retryable_error("something odd happened"));
        }
    }

    mod runner_error {
        use super::*;

        #[test]
        fn test_connection_retryable_by_reason() {
            assert!(connection("Connection refused").is_retryable());
            assert!(!connection("SSH protocol error").is_retryable());
        }

        #[test]
        fn test_authentication_never_retryable() {
            let err = RunnerError::Authentication {
                host: "h".to_string(),
                port: 22,
                username: "u".to_string(),
                reason: "timeout".to_string(),
            };
            assert!(!err.is_retryable());
            assert!(err.is_authentication());
        }

        #[test]
        fn test_display_carries_context() {
            let msg = connection("Connection refused").to_string();
            assert!(msg.contains("admin@10.0.0.1:22"));
            assert!(msg.contains("Connection refused"));
        }

        #[test]
        fn test_login_rejected_is_authentication() {
            assert!(RunnerError::LoginRejected("access denied".to_string()).is_authentication());
            assert!(!RunnerError::PromptNotDetected.is_authentication());
        }
    }
}
