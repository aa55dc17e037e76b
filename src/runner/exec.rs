//! Direct exec channel runner.
//!
//! Fast and unambiguous when the target supports it: stdout and stderr
//! arrive separately and the exit status says whether the command worked.
//! Some appliances accept the exec request and then never close the
//! channel, so the wait is always bounded by the command deadline and a
//! timeout keeps whatever output arrived.

use russh::{ChannelMsg, client};
use tracing::{Instrument, debug, info_span, warn};

use super::ansi;
use super::client::SessionHandler;
use super::config::RunnerConfig;
use super::error::RunnerError;
use super::poll::Deadline;
use super::types::{ChannelKind, CommandResult};

/// Output collected from one exec channel.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecCapture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    eof: bool,
}

impl ExecCapture {
    pub fn new() -> Self {
        Self {
            stdout: Vec::with_capacity(4096),
            stderr: Vec::with_capacity(1024),
            ..Default::default()
        }
    }

    pub fn on_stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }

    pub fn on_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }

    /// Record the exit status. Returns `true` once the capture is complete.
    pub fn on_exit_status(&mut self, status: u32) -> bool {
        self.exit_status = Some(status);
        self.eof
    }

    /// Record EOF. Returns `true` once the capture is complete.
    pub fn on_eof(&mut self) -> bool {
        self.eof = true;
        self.exit_status.is_some()
    }

    /// Record a refused channel request.
    ///
    /// Before any output or status the exec request itself was refused.
    /// Later refusals belong to unrelated requests and are ignored.
    pub fn on_failure(&self) -> Result<(), RunnerError> {
        if self.stdout.is_empty() && self.stderr.is_empty() && self.exit_status.is_none() {
            return Err(RunnerError::ChannelOpen("exec request rejected".to_string()));
        }
        Ok(())
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    /// Fold the capture into a result. Success requires exit status zero.
    pub fn into_result(
        self,
        timeout: Option<std::time::Duration>,
        elapsed: std::time::Duration,
    ) -> CommandResult {
        let output = ansi::clean_bytes(&self.stdout).trim_end().to_string();
        let stderr = ansi::clean_bytes(&self.stderr).trim_end().to_string();

        let error = match (timeout, self.exit_status) {
            (Some(budget), _) => join_error(RunnerError::CommandTimeout(budget).to_string(), &stderr),
            (None, Some(0)) => stderr,
            (None, Some(code)) if stderr.is_empty() => format!("exit status {}", code),
            (None, Some(_)) => stderr,
            (None, None) => join_error("channel closed without an exit status".to_string(), &stderr),
        };

        CommandResult {
            output,
            error,
            success: timeout.is_none() && self.exit_status == Some(0),
            channel_kind: ChannelKind::Exec,
            elapsed,
        }
    }
}

fn join_error(reason: String, stderr: &str) -> String {
    if stderr.is_empty() {
        reason
    } else {
        format!("{}: {}", reason, stderr)
    }
}

/// Runs commands over a direct exec channel.
#[derive(Debug, Clone)]
pub struct ExecChannelRunner {
    config: RunnerConfig,
}

impl ExecChannelRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Run `command` on a new exec channel of `handle`.
    ///
    /// Never fails: channel errors become a failed [`CommandResult`].
    pub async fn run(
        &self,
        handle: &client::Handle<SessionHandler>,
        command: &str,
        deadline: &Deadline,
    ) -> CommandResult {
        async {
            match self.try_run(handle, command, deadline).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Exec channel unavailable");
                    CommandResult::failed(ChannelKind::Exec, e.to_string(), deadline.elapsed())
                }
            }
        }
        .instrument(info_span!("exec"))
        .await
    }

    async fn try_run(
        &self,
        handle: &client::Handle<SessionHandler>,
        command: &str,
        deadline: &Deadline,
    ) -> Result<CommandResult, RunnerError> {
        let budget = deadline.clamp(self.config.channel_open_timeout);
        let open = async {
            let channel = handle
                .channel_open_session()
                .await
                .map_err(|e| RunnerError::ChannelOpen(format!("Failed to open channel: {}", e)))?;
            channel
                .exec(true, command)
                .await
                .map_err(|e| RunnerError::ChannelOpen(format!("Failed to execute command: {}", e)))?;
            Ok::<_, RunnerError>(channel)
        };
        let mut channel = tokio::time::timeout(budget, open)
            .await
            .map_err(|_| RunnerError::ChannelOpen(format!("Exec request timed out after {:?}", budget)))??;

        let mut capture = ExecCapture::new();
        let waited = tokio::time::timeout(deadline.remaining(), async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => capture.on_stdout(&data),
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // ext == 1 is stderr in SSH protocol
                        if ext == 1 {
                            capture.on_stderr(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        if capture.on_exit_status(exit_status) {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        if capture.on_eof() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Failure) => capture.on_failure()?,
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
            Ok::<_, RunnerError>(())
        })
        .await;

        if let Ok(Err(e)) = waited {
            self.close(&channel).await;
            return Err(e);
        }

        let timeout = if waited.is_err() {
            warn!(
                timeout = ?self.config.command_timeout,
                "Exec command timed out, returning partial output"
            );
            Some(self.config.command_timeout)
        } else {
            None
        };

        self.close(&channel).await;

        debug!(exit_status = ?capture.exit_status(), "Exec channel finished");
        Ok(capture.into_result(timeout, deadline.elapsed()))
    }

    /// Close the channel so the session can be reused or closed cleanly.
    async fn close(&self, channel: &russh::Channel<client::Msg>) {
        match tokio::time::timeout(self.config.poll_interval, channel.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Exec channel close failed"),
            Err(_) => debug!("Exec channel close stalled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_completes_on_status_then_eof() {
        let mut capture = ExecCapture::new();
        capture.on_stdout(b"hi\n");
        assert!(!capture.on_exit_status(0));
        assert!(capture.on_eof());
    }

    #[test]
    fn test_completes_on_eof_then_status() {
        let mut capture = ExecCapture::new();
        assert!(!capture.on_eof());
        assert!(capture.on_exit_status(1));
    }

    #[test]
    fn test_zero_exit_is_success() {
        let mut capture = ExecCapture::new();
        capture.on_stdout(b"\x1b[32mok\x1b[0m\r\n");
        capture.on_exit_status(0);
        let result = capture.into_result(None, Duration::from_millis(40));
        assert!(result.success);
        assert_eq!(result.output, "ok");
        assert_eq!(result.channel_kind, ChannelKind::Exec);
        assert!(result.error.is_empty());
    }

    #[test]
    fn test_nonzero_exit_reports_stderr() {
        let mut capture = ExecCapture::new();
        capture.on_stderr(b"ls: cannot access 'x'\n");
        capture.on_exit_status(2);
        let result = capture.into_result(None, Duration::ZERO);
        assert!(!result.success);
        assert_eq!(result.error, "ls: cannot access 'x'");
    }

    #[test]
    fn test_nonzero_exit_without_stderr() {
        let mut capture = ExecCapture::new();
        capture.on_exit_status(127);
        let result = capture.into_result(None, Duration::ZERO);
        assert_eq!(result.error, "exit status 127");
    }

    #[test]
    fn test_output_without_exit_status_is_not_success() {
        let mut capture = ExecCapture::new();
        capture.on_stdout(b"looks fine\n");
        capture.on_eof();
        let result = capture.into_result(None, Duration::ZERO);
        assert!(!result.success);
        assert_eq!(result.output, "looks fine");
    }

    #[test]
    fn test_refusal_before_output_is_rejected_exec() {
        let capture = ExecCapture::new();
        let err = capture.on_failure().unwrap_err();
        assert!(matches!(err, RunnerError::ChannelOpen(ref msg) if msg == "exec request rejected"));
    }

    #[test]
    fn test_refusal_after_output_ignored() {
        let mut capture = ExecCapture::new();
        capture.on_stdout(b"running\n");
        assert!(capture.on_failure().is_ok());
        capture.on_exit_status(0);
        assert!(capture.into_result(None, Duration::ZERO).success);
    }

    #[test]
    fn test_timeout_keeps_partial_output() {
        let mut capture = ExecCapture::new();
        capture.on_stdout(b"partial");
        let result = capture.into_result(Some(Duration::from_secs(10)), Duration::from_secs(10));
        assert!(!result.success);
        assert_eq!(result.output, "partial");
        assert!(result.error.contains("did not complete"));
    }
}
