//! Racing exec and shell channels for one command.
//!
//! Two authenticated sessions are opened concurrently to learn whether the
//! target accepts more than one. Once the first is up the second gets a short
//! window, after which it is abandoned. When both come up, the exec and shell runners run side by side on their
//! own tasks: an exec result that succeeds wins and the shell task is
//! cancelled, otherwise the shell result is returned. When the target only
//! tolerates one session, the shell runs first on that session and exec is
//! tried afterwards as an enrichment.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use super::client::{Session, SessionConnector};
use super::config::RunnerConfig;
use super::error::RunnerError;
use super::poll::Deadline;
use super::types::{ChannelKind, CommandResult, Credential, PtyProfile};

/// One authenticated session able to run both channel strategies.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn run_exec(&self, command: &str, deadline: &Deadline) -> CommandResult;

    async fn run_shell(
        &self,
        command: &str,
        profile: PtyProfile,
        deadline: &Deadline,
        cancel: &CancellationToken,
    ) -> CommandResult;

    /// Tear the session down. Must be idempotent.
    async fn close(&self);
}

/// Opens sessions to a single target.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_session(&self, deadline: &Deadline) -> Result<Box<dyn RemoteSession>, RunnerError>;
}

#[async_trait]
impl RemoteSession for Session {
    async fn run_exec(&self, command: &str, deadline: &Deadline) -> CommandResult {
        Session::run_exec(self, command, deadline).await
    }

    async fn run_shell(
        &self,
        command: &str,
        profile: PtyProfile,
        deadline: &Deadline,
        cancel: &CancellationToken,
    ) -> CommandResult {
        Session::run_shell(self, command, profile, deadline, cancel).await
    }

    async fn close(&self) {
        Session::close(self).await
    }
}

/// SSH sessions for one credential.
#[derive(Debug, Clone)]
pub struct SshTransport {
    credential: Credential,
    connector: SessionConnector,
}

impl SshTransport {
    pub fn new(credential: Credential, config: RunnerConfig) -> Self {
        Self {
            credential,
            connector: SessionConnector::new(config),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_session(&self, deadline: &Deadline) -> Result<Box<dyn RemoteSession>, RunnerError> {
        let session = self.connector.connect_within(&self.credential, deadline).await?;
        Ok(Box::new(session))
    }
}

/// Shell first, exec only when the shell result failed.
///
/// Exec replaces the shell result only when it succeeds, so a target without
/// exec support gets exactly the shell runner's result.
pub(crate) async fn run_sequential(
    session: &dyn RemoteSession,
    command: &str,
    profile: PtyProfile,
    deadline: &Deadline,
) -> CommandResult {
    let shell = session
        .run_shell(command, profile, deadline, &CancellationToken::new())
        .await;
    if shell.success || deadline.is_expired() {
        return shell;
    }

    let exec = session.run_exec(command, deadline).await;
    if exec.success {
        debug!("Exec enrichment replaced a failed shell result");
        exec
    } else {
        shell
    }
}

/// Runs commands through whichever channel strategy the target supports.
pub struct ChannelRaceExecutor<T> {
    transport: T,
    config: RunnerConfig,
}

impl ChannelRaceExecutor<SshTransport> {
    pub fn for_credential(credential: Credential, config: RunnerConfig) -> Self {
        let transport = SshTransport::new(credential, config.clone());
        Self::new(transport, config)
    }
}

impl<T: Transport> ChannelRaceExecutor<T> {
    pub fn new(transport: T, config: RunnerConfig) -> Self {
        Self { transport, config }
    }

    /// Run `command` within the configured command timeout.
    ///
    /// Connection, authentication and channel failures come back as a failed
    /// [`CommandResult`]. Only an empty command is an error.
    pub async fn execute(&self, command: &str, is_privileged: bool) -> Result<CommandResult, RunnerError> {
        if command.trim().is_empty() {
            return Err(RunnerError::InvalidInput("command must not be empty".to_string()));
        }

        let deadline = Deadline::after(self.config.command_timeout);
        let profile = PtyProfile::for_privileged(is_privileged);

        let (first, second) = self.open_pair(&deadline).await;

        let result = match (first, second) {
            (Ok(exec_session), Ok(shell_session)) => {
                self.race(exec_session, shell_session, command, profile, deadline)
                    .instrument(info_span!("race", mode = "parallel"))
                    .await
            }
            (Ok(session), Err(e)) | (Err(e), Ok(session)) => {
                info!(error = %e, "Target refused a second session, running sequentially");
                self.sequential(session, command, profile, &deadline).await
            }
            (Err(e), Err(_)) if e.is_authentication() || deadline.is_expired() => {
                CommandResult::failed(ChannelKind::Shell, e.to_string(), deadline.elapsed())
            }
            (Err(e), Err(_)) => {
                // Some targets drop concurrent handshakes outright.
                debug!(error = %e, "Both concurrent sessions failed, retrying with one");
                match self.transport.open_session(&deadline).await {
                    Ok(session) => self.sequential(session, command, profile, &deadline).await,
                    Err(e) => CommandResult::failed(ChannelKind::Shell, e.to_string(), deadline.elapsed()),
                }
            }
        };

        info!(
            channel = %result.channel_kind,
            success = result.success,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Command finished"
        );
        Ok(result)
    }

    /// Open two sessions concurrently.
    ///
    /// When one comes up, the other must follow within a quarter of the
    /// remaining budget (at most the channel open timeout) or it is dropped.
    async fn open_pair(
        &self,
        deadline: &Deadline,
    ) -> (
        Result<Box<dyn RemoteSession>, RunnerError>,
        Result<Box<dyn RemoteSession>, RunnerError>,
    ) {
        let mut first = self.transport.open_session(deadline);
        let mut second = self.transport.open_session(deadline);
        let (settled, straggler) = tokio::select! {
            result = &mut first => (result, second),
            result = &mut second => (result, first),
        };
        if settled.is_err() {
            return (settled, straggler.await);
        }

        let window = deadline
            .clamp(self.config.channel_open_timeout)
            .min(deadline.remaining() / 4);
        match tokio::time::timeout(window, straggler).await {
            Ok(other) => (settled, other),
            Err(_) => {
                debug!(?window, "Second session still handshaking, abandoning it");
                let err = RunnerError::ChannelOpen(format!("second session not ready within {:?}", window));
                (settled, Err(err))
            }
        }
    }

    async fn sequential(
        &self,
        session: Box<dyn RemoteSession>,
        command: &str,
        profile: PtyProfile,
        deadline: &Deadline,
    ) -> CommandResult {
        let result = run_sequential(session.as_ref(), command, profile, deadline)
            .instrument(info_span!("race", mode = "sequential"))
            .await;
        session.close().await;
        result
    }

    async fn race(
        &self,
        exec_session: Box<dyn RemoteSession>,
        shell_session: Box<dyn RemoteSession>,
        command: &str,
        profile: PtyProfile,
        deadline: Deadline,
    ) -> CommandResult {
        let cancel = CancellationToken::new();

        let shell_task = {
            let cancel = cancel.clone();
            let command = command.to_string();
            tokio::spawn(
                async move {
                    let result = shell_session
                        .run_shell(&command, profile, &deadline, &cancel)
                        .await;
                    shell_session.close().await;
                    result
                }
                .instrument(Span::current()),
            )
        };

        let mut exec_task = {
            let command = command.to_string();
            tokio::spawn(
                async move {
                    let result = exec_session.run_exec(&command, &deadline).await;
                    exec_session.close().await;
                    result
                }
                .instrument(Span::current()),
            )
        };

        match tokio::time::timeout(deadline.remaining(), &mut exec_task).await {
            Ok(Ok(result)) if result.success => {
                cancel.cancel();
                // The shell task closes its own session; give it one poll to do so.
                let grace = self.config.poll_interval.max(Duration::from_millis(1));
                if tokio::time::timeout(grace, shell_task).await.is_err() {
                    debug!("Cancelled shell task still closing");
                }
                return result;
            }
            Ok(Ok(result)) => debug!(error = %result.error, "Exec failed, using shell result"),
            Ok(Err(e)) => warn!(error = %e, "Exec task panicked, using shell result"),
            // Dropping the handle detaches the task; it still closes its session.
            Err(_) => debug!("Exec did not resolve within the command timeout"),
        }

        match shell_task.await {
            Ok(result) => result,
            Err(e) => CommandResult::failed(
                ChannelKind::Shell,
                format!("shell task failed: {}", e),
                deadline.elapsed(),
            ),
        }
    }
}
