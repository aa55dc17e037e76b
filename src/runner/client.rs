//! SSH session establishment.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: permissive algorithm lists so legacy
//!    appliances still negotiate (older DH groups, CBC ciphers), keepalive
//!    and optional compression.
//! 2. **Connection Establishment**: TCP connect and key exchange, bounded by
//!    the connect timeout.
//! 3. **Authentication**: password or private key, bounded by its own
//!    timeout. A rejected credential disconnects the half-open transport
//!    before the error is returned.
//!
//! ## Retry Strategy
//!
//! Connection attempts use exponential backoff with jitter via `backon`.
//! Only transient transport failures retry; authentication failures never
//! do, to avoid account lockouts.
//!
//! Host keys are accepted without verification, like
//! `StrictHostKeyChecking=no`. Callers needing verification must layer it on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use russh::{Disconnect, client, keys};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::strategy_for;
use super::config::RunnerConfig;
use super::error::RunnerError;
use super::exec::ExecChannelRunner;
use super::poll::Deadline;
use super::race::run_sequential;
use super::shell::ShellChannelRunner;
use super::types::{CommandResult, Credential, PtyProfile};

/// Client handler for russh that accepts all host keys.
pub struct SessionHandler;

impl client::Handler for SessionHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Build russh client configuration.
///
/// Algorithm preferences start from russh's defaults and append the legacy
/// key exchanges and CBC ciphers that older network appliances still need.
pub(crate) fn build_client_config(inactivity: Duration, compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let defaults = russh::Preferred::default();

    let mut kex = defaults.kex.to_vec();
    for legacy in [
        russh::kex::DH_G14_SHA256,
        russh::kex::DH_G14_SHA1,
        russh::kex::DH_G1_SHA1,
    ] {
        if !kex.contains(&legacy) {
            kex.push(legacy);
        }
    }

    let mut cipher = defaults.cipher.to_vec();
    for legacy in [
        russh::cipher::AES_256_CBC,
        russh::cipher::AES_192_CBC,
        russh::cipher::AES_128_CBC,
    ] {
        if !cipher.contains(&legacy) {
            cipher.push(legacy);
        }
    }

    let preferred = russh::Preferred {
        kex: kex.into(),
        cipher: cipher.into(),
        compression,
        ..defaults
    };

    Arc::new(client::Config {
        inactivity_timeout: Some(inactivity),
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Opens authenticated sessions for credentials.
#[derive(Debug, Clone)]
pub struct SessionConnector {
    config: RunnerConfig,
}

impl SessionConnector {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Connect and authenticate within the configured connect and auth timeouts.
    pub async fn connect(&self, credential: &Credential) -> Result<Session, RunnerError> {
        let deadline = Deadline::after(self.config.connect_timeout + self.config.auth_timeout);
        self.connect_within(credential, &deadline).await
    }

    /// Connect with retries, never exceeding `deadline`.
    pub async fn connect_within(
        &self,
        credential: &Credential,
        deadline: &Deadline,
    ) -> Result<Session, RunnerError> {
        let attempt_counter = AtomicU32::new(0);
        let target = credential.target();

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.retry_delay)
            .with_max_delay(self.config.max_retry_delay)
            .with_max_times(self.config.max_retries as usize)
            .with_jitter();

        let attempts = (|| async {
            let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if current_attempt > 0 {
                warn!("SSH connection retry attempt {} to {}", current_attempt, target);
            }
            self.connect_once(credential, deadline).await
        })
        .retry(backoff)
        .when(|e: &RunnerError| {
            let retryable = e.is_retryable() && !deadline.is_expired();
            if !retryable {
                warn!("SSH connection to {} failed with non-retryable error: {}", target, e);
            }
            retryable
        })
        .notify(|err, dur| {
            warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
        });

        // Backoff sleeps count against the same budget as the attempts.
        let budget = deadline.remaining();
        let result = match tokio::time::timeout(budget, attempts).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Connection {
                host: credential.host().to_string(),
                port: credential.port(),
                username: credential.username().to_string(),
                reason: format!("Connection attempts exceeded the {:?} budget", budget),
            }),
        };

        let total_attempts = attempt_counter.load(Ordering::SeqCst);
        match result {
            Ok(session) => {
                if total_attempts > 1 {
                    info!(
                        "SSH connection to {} succeeded after {} retry attempt(s)",
                        target,
                        total_attempts - 1
                    );
                }
                Ok(session)
            }
            Err(e) => {
                error!(
                    "SSH connection to {} failed after {} attempt(s). Last error: {}",
                    target, total_attempts, e
                );
                Err(e)
            }
        }
    }

    async fn connect_once(
        &self,
        credential: &Credential,
        deadline: &Deadline,
    ) -> Result<Session, RunnerError> {
        let connection_error = |reason: String| RunnerError::Connection {
            host: credential.host().to_string(),
            port: credential.port(),
            username: credential.username().to_string(),
            reason,
        };
        let auth_error = |reason: String| RunnerError::Authentication {
            host: credential.host().to_string(),
            port: credential.port(),
            username: credential.username().to_string(),
            reason,
        };

        let inactivity = self.config.connect_timeout + self.config.command_timeout;
        let client_config = build_client_config(inactivity, self.config.compression);

        let connect_budget = deadline.clamp(self.config.connect_timeout);
        let connect_future = client::connect(
            client_config,
            (credential.host(), credential.port()),
            SessionHandler,
        );
        let mut handle = tokio::time::timeout(connect_budget, connect_future)
            .await
            .map_err(|_| connection_error(format!("Connection timed out after {:?}", connect_budget)))?
            .map_err(|e| connection_error(format!("Failed to connect: {}", e)))?;

        let strategy = strategy_for(credential.secret());
        let auth_budget = deadline.clamp(self.config.auth_timeout);
        let outcome = tokio::time::timeout(
            auth_budget,
            strategy.authenticate(&mut handle, credential.username()),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(format!("{} authentication rejected", strategy.name())),
            Ok(Err(e)) => Some(e),
            Err(_) => Some(format!("Authentication timed out after {:?}", auth_budget)),
        };
        if let Some(reason) = failure {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await
            {
                debug!(error = %e, "Disconnect after failed authentication failed");
            }
            return Err(auth_error(reason));
        }

        debug!(strategy = strategy.name(), "Authenticated {}", credential.target());
        Ok(Session::new(handle, credential.clone(), self.config.clone()))
    }
}

/// An authenticated transport connection.
///
/// Owned by whichever component opened it; [`Session::close`] is idempotent
/// so the connection is torn down exactly once.
pub struct Session {
    handle: client::Handle<SessionHandler>,
    credential: Credential,
    config: RunnerConfig,
    closed: AtomicBool,
}

impl Session {
    fn new(handle: client::Handle<SessionHandler>, credential: Credential, config: RunnerConfig) -> Self {
        Self {
            handle,
            credential,
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }

    /// Run `command` over a direct exec channel.
    pub async fn run_exec(&self, command: &str, deadline: &Deadline) -> CommandResult {
        ExecChannelRunner::new(self.config.clone())
            .run(&self.handle, command, deadline)
            .await
    }

    /// Run `command` over an interactive PTY shell channel.
    pub async fn run_shell(
        &self,
        command: &str,
        profile: PtyProfile,
        deadline: &Deadline,
        cancel: &CancellationToken,
    ) -> CommandResult {
        ShellChannelRunner::new(self.credential.clone(), self.config.clone())
            .run(&self.handle, command, profile, deadline, cancel)
            .await
    }

    /// Run `command` on this session within `timeout`.
    ///
    /// The shell channel runs first; the exec channel is only tried when
    /// the shell result failed, and replaces it only when it succeeds.
    pub async fn execute(
        &self,
        command: &str,
        is_privileged: bool,
        timeout: Duration,
    ) -> Result<CommandResult, RunnerError> {
        if command.trim().is_empty() {
            return Err(RunnerError::InvalidInput("command must not be empty".to_string()));
        }
        let deadline = Deadline::after(timeout);
        let profile = PtyProfile::for_privileged(is_privileged);
        Ok(run_sequential(self, command, profile, &deadline).await)
    }

    /// Disconnect. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "Disconnect failed");
        }
    }
}
