//! MCP tool implementation.
//!
//! - `ssh_run_command`: connect, run one command through the exec/shell
//!   channel race, and disconnect

use poem_mcpserver::{Tools, tool::StructuredContent};
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use super::types::SshRunResponse;
use crate::runner::types::DEFAULT_SSH_PORT;
use crate::runner::{ChannelRaceExecutor, Credential, RunOverrides, RunnerConfig, RunnerError};

/// MCP tool for running commands on servers and network appliances.
pub struct McpShellRunner;

#[Tools]
impl McpShellRunner {
    /// Run a single command on a remote host over SSH and return its output.
    ///
    /// Works with regular servers and with network appliances whose SSH
    /// servers only offer an interactive shell. Both a direct exec channel and
    /// an interactive PTY shell are tried; prompts, `--More--` pagination and
    /// device-level login prompts are handled automatically.
    ///
    /// Connection and command failures are reported in the result with
    /// `success=false`, keeping any partial output.
    #[allow(clippy::too_many_arguments)]
    async fn ssh_run_command(
        &self,
        /// Hostname or IP address of the target
        host: String,
        /// SSH port (default: 22)
        port: Option<u16>,
        /// SSH username
        username: String,
        /// Password for password authentication (also answers device login prompts)
        password: Option<String>,
        /// PEM/OpenSSH private key material (not a path); takes precedence over password
        private_key: Option<String>,
        /// Passphrase for an encrypted private key
        passphrase: Option<String>,
        /// Command to run
        command: String,
        /// Request a full vt100 terminal instead of a minimal one (default: false)
        privileged: Option<bool>,
        /// Overall command budget in seconds (default: 10, env: SSH_COMMAND_TIMEOUT)
        timeout_secs: Option<u64>,
        /// Completion detection and terminal overrides
        options: Option<RunOverrides>,
    ) -> Result<StructuredContent<SshRunResponse>, String> {
        let credential = build_credential(host, port, username, password, private_key, passphrase)
            .map_err(|e| e.to_string())?;

        let mut overrides = options.unwrap_or_default();
        if timeout_secs.is_some() {
            overrides.timeout_secs = timeout_secs;
        }
        let config = RunnerConfig::resolve(&overrides);

        let run_id = Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now().to_rfc3339();
        let target = credential.target();

        info!(
            "Running command on {} with timeout {}s",
            target,
            config.command_timeout.as_secs()
        );

        let span = info_span!("ssh_run", run_id = %run_id, target = %target);
        let result = ChannelRaceExecutor::for_credential(credential, config)
            .execute(&command, privileged.unwrap_or(false))
            .instrument(span)
            .await
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(SshRunResponse {
            run_id,
            started_at,
            target,
            result,
        }))
    }
}

/// Build a credential from tool arguments. Key material wins over a password.
pub(crate) fn build_credential(
    host: String,
    port: Option<u16>,
    username: String,
    password: Option<String>,
    private_key: Option<String>,
    passphrase: Option<String>,
) -> Result<Credential, RunnerError> {
    let port = port.unwrap_or(DEFAULT_SSH_PORT);
    match (private_key, password) {
        (Some(key), _) if !key.trim().is_empty() => {
            Credential::with_private_key(host, port, username, key, passphrase)
        }
        (_, Some(password)) => Credential::with_password(host, port, username, password),
        _ => Err(RunnerError::InvalidInput(
            "either password or private_key is required".to_string(),
        )),
    }
}
