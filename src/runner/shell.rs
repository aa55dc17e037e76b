//! Interactive PTY shell runner.
//!
//! One command cycle over a fresh shell channel:
//!
//! 1. open the channel, request a PTY and a shell
//! 2. let the banner settle
//! 3. answer a shell-level login challenge if one is showing
//! 4. solicit and infer the prompt
//! 5. clear the buffer, send the command (and `exit` in append-exit mode)
//! 6. wait for completion, paging through `--More--` as needed
//! 7. clean the captured text
//!
//! Every phase draws from one [`Deadline`], so the whole cycle returns
//! within the command timeout plus one poll interval.

use async_trait::async_trait;
use russh::{ChannelMsg, ChannelWriteHalf, client};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::client::SessionHandler;
use super::completion::{CommandCompletionDetector, strip_pagination};
use super::config::RunnerConfig;
use super::error::RunnerError;
use super::login::{LoginSequencer, needs_login};
use super::poll::{Deadline, send_within};
use super::prompt::{detect_prompt, wait_for_quiet};
use super::terminal::{TerminalBuffer, TerminalInput};
use super::types::{ChannelKind, CommandResult, Credential, PtyProfile};

/// Write handle for sending input to a shell channel.
///
/// Wraps `russh::ChannelWriteHalf` so keystrokes can be written while the
/// reader task owns the read half.
pub struct ChannelWriter {
    write_half: ChannelWriteHalf<client::Msg>,
}

impl ChannelWriter {
    pub fn new(write_half: ChannelWriteHalf<client::Msg>) -> Self {
        Self { write_half }
    }

    /// Close the channel gracefully.
    pub async fn close(&self) -> Result<(), RunnerError> {
        self.write_half
            .close()
            .await
            .map_err(|e| RunnerError::ChannelIo(format!("Failed to close shell channel: {}", e)))
    }
}

#[async_trait]
impl TerminalInput for ChannelWriter {
    async fn send(&self, data: &[u8]) -> Result<(), RunnerError> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| RunnerError::ChannelIo(format!("Failed to write to shell: {}", e)))
    }
}

/// Runs commands over interactive PTY shell channels.
#[derive(Debug, Clone)]
pub struct ShellChannelRunner {
    credential: Credential,
    config: RunnerConfig,
}

impl ShellChannelRunner {
    pub fn new(credential: Credential, config: RunnerConfig) -> Self {
        Self { credential, config }
    }

    /// Run `command` on a new shell channel of `handle`.
    ///
    /// Never fails: channel and login errors become a failed
    /// [`CommandResult`]. Cancelling `cancel` abandons the cycle and closes
    /// the channel.
    pub async fn run(
        &self,
        handle: &client::Handle<SessionHandler>,
        command: &str,
        profile: PtyProfile,
        deadline: &Deadline,
        cancel: &CancellationToken,
    ) -> CommandResult {
        let span = info_span!("shell", term = profile.term());
        async {
            let buffer = TerminalBuffer::new(self.config.pty_rows as usize);
            let writer = match self.open(handle, profile, &buffer, deadline).await {
                Ok(writer) => writer,
                Err(e) => {
                    warn!(error = %e, "Shell channel unavailable");
                    return CommandResult::failed(ChannelKind::Shell, e.to_string(), deadline.elapsed());
                }
            };

            let result = tokio::select! {
                result = self.execute_on(&buffer, &writer, command, deadline) => result,
                _ = cancel.cancelled() => {
                    debug!("Shell run cancelled");
                    CommandResult::failed(ChannelKind::Shell, "cancelled", deadline.elapsed())
                }
            };

            // Close on every exit path; the reader task ends with the channel.
            match tokio::time::timeout(self.config.poll_interval, writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Shell channel close failed"),
                Err(_) => debug!("Shell channel close stalled"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Open a PTY shell channel and start the reader task feeding `buffer`.
    async fn open(
        &self,
        handle: &client::Handle<SessionHandler>,
        profile: PtyProfile,
        buffer: &TerminalBuffer,
        deadline: &Deadline,
    ) -> Result<ChannelWriter, RunnerError> {
        let budget = deadline.clamp(self.config.channel_open_timeout);
        let open = async {
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| RunnerError::ChannelOpen(format!("Failed to open channel: {}", e)))?;
            channel
                .request_pty(
                    true,
                    profile.term(),
                    self.config.pty_cols,
                    self.config.pty_rows,
                    0,
                    0,
                    &[],
                )
                .await
                .map_err(|e| RunnerError::ChannelOpen(format!("Failed to request PTY: {}", e)))?;
            channel
                .request_shell(true)
                .await
                .map_err(|e| RunnerError::ChannelOpen(format!("Failed to request shell: {}", e)))?;

            // Replies arrive in request order; banner bytes may already follow.
            let mut pending = 2;
            let mut early = Vec::new();
            while pending > 0 {
                let msg = channel.wait().await.ok_or_else(|| {
                    RunnerError::ChannelOpen("channel closed before the shell started".to_string())
                })?;
                acknowledge(&msg, &mut pending)?;
                if let ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } = msg {
                    early.extend_from_slice(&data);
                }
            }
            Ok::<_, RunnerError>((channel, early))
        };
        let (channel, early) = tokio::time::timeout(budget, open)
            .await
            .map_err(|_| RunnerError::ChannelOpen(format!("Channel open timed out after {:?}", budget)))??;

        buffer.append(&early);
        let (mut read_half, write_half) = channel.split();
        let reader_buffer = buffer.clone();
        tokio::spawn(async move {
            while let Some(msg) = read_half.wait().await {
                match msg {
                    ChannelMsg::Data { data } => reader_buffer.append(&data),
                    // PTY channels merge stderr into the same stream
                    ChannelMsg::ExtendedData { data, .. } => reader_buffer.append(&data),
                    ChannelMsg::Eof | ChannelMsg::Close => break,
                    _ => {}
                }
            }
            reader_buffer.mark_closed();
        });

        Ok(ChannelWriter::new(write_half))
    }

    /// Drive one command cycle against an already open terminal.
    pub async fn execute_on(
        &self,
        buffer: &TerminalBuffer,
        input: &dyn TerminalInput,
        command: &str,
        deadline: &Deadline,
    ) -> CommandResult {
        match self.drive(buffer, input, command, deadline).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Shell cycle failed");
                CommandResult::failed(ChannelKind::Shell, e.to_string(), deadline.elapsed())
            }
        }
    }

    async fn drive(
        &self,
        buffer: &TerminalBuffer,
        input: &dyn TerminalInput,
        command: &str,
        deadline: &Deadline,
    ) -> Result<CommandResult, RunnerError> {
        let config = &self.config;
        let settle = deadline.child(config.prompt_settle);
        wait_for_quiet(buffer, input, config.poll_interval, config.short_stability, &settle).await?;

        if needs_login(&buffer.screen()) {
            info!("Shell-level login challenge detected");
            LoginSequencer::new(&self.credential, config)
                .run(buffer, input, deadline)
                .await?;
        }

        let settle = deadline.child(config.prompt_settle);
        let prompt = match detect_prompt(
            buffer,
            input,
            config.poll_interval,
            config.short_stability,
            &settle,
        )
        .await
        {
            Ok(prompt) => Some(prompt),
            Err(RunnerError::PromptNotDetected) => {
                warn!("No prompt detected, relying on completion score");
                None
            }
            Err(e) => return Err(e),
        };

        buffer.reset();
        send_within(input, format!("{}\n", command).as_bytes(), deadline, config.poll_interval).await?;
        if config.append_exit {
            send_within(input, b"exit\n", deadline, config.poll_interval).await?;
        }
        info!(prompt = ?prompt, "Command sent");

        let completion = CommandCompletionDetector::new(config, prompt.clone())
            .wait(buffer, input, deadline)
            .await?;
        let output = clean_output(&completion.text, command, prompt.as_deref(), config.append_exit);
        let elapsed = deadline.elapsed();

        if completion.timed_out() {
            return Ok(CommandResult {
                output,
                error: RunnerError::CommandTimeout(config.command_timeout).to_string(),
                success: false,
                channel_kind: ChannelKind::Shell,
                elapsed,
            });
        }
        info!(reason = ?completion.reason, continuations = completion.continuations, "Shell command completed");
        Ok(CommandResult::succeeded(ChannelKind::Shell, output, elapsed))
    }
}

/// Account for one reply to a `want_reply` channel request.
///
/// Decrements `pending` on success. A refusal, or the channel ending while
/// replies are outstanding, is a [`RunnerError::ChannelOpen`].
fn acknowledge(msg: &ChannelMsg, pending: &mut usize) -> Result<(), RunnerError> {
    match msg {
        ChannelMsg::Success => {
            *pending = pending.saturating_sub(1);
            Ok(())
        }
        ChannelMsg::Failure => Err(RunnerError::ChannelOpen(
            "PTY or shell request rejected".to_string(),
        )),
        ChannelMsg::Eof | ChannelMsg::Close => Err(RunnerError::ChannelOpen(
            "channel closed before the shell started".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Reduce a raw shell capture to the command's own output.
///
/// - leading blank lines are dropped
/// - the first line echoing the command is dropped
/// - whole lines equal to the prompt, or the prompt followed by the
///   command, are dropped; lines merely containing the prompt are kept
/// - in append-exit mode, prompt+`exit` lines and trailing `exit`/`logout`
///   artifacts are dropped
/// - trailing whitespace is trimmed per line and runs of blank lines are
///   collapsed to one
pub fn clean_output(text: &str, command: &str, prompt: Option<&str>, append_exit: bool) -> String {
    let text = strip_pagination(text);
    let command = command.trim();
    let prompt = prompt.map(str::trim).filter(|p| !p.is_empty());

    let is_prompt_line = |line: &str| -> bool {
        let Some(prompt) = prompt else {
            return false;
        };
        match line.trim().strip_prefix(prompt) {
            Some(rest) => {
                let rest = rest.trim();
                rest.is_empty()
                    || rest == command
                    || (append_exit && is_exit_artifact(rest))
            }
            None => false,
        }
    };

    let mut lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .skip_while(|line| line.trim().is_empty())
        .collect();

    if let Some(first) = lines.first()
        && !is_prompt_line(first)
        && !command.is_empty()
        && first.trim() == command
    {
        lines.remove(0);
    }

    lines.retain(|line| !is_prompt_line(line));

    if append_exit {
        while let Some(last) = lines.last() {
            let last = last.trim();
            if last.is_empty() || is_exit_artifact(last) {
                lines.pop();
            } else {
                break;
            }
        }
    }

    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut blank_run = 0;
    for line in lines {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push(line);
    }
    while out.first().is_some_and(|l| l.trim().is_empty()) {
        out.remove(0);
    }
    out.join("\n").trim_end().to_string()
}

fn is_exit_artifact(line: &str) -> bool {
    matches!(line, "exit" | "logout")
}
