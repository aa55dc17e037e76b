//! Shell-level login challenges.
//!
//! Some appliances accept the transport connection and then present their
//! own `Username:` / `Password:` exchange inside the PTY. The
//! [`LoginSequencer`] watches the screen and answers until a device prompt
//! appears.
//!
//! Each tick classifies the last screen line; the first match wins:
//!
//! 1. device prompt shape, login done
//! 2. failure marker in the output that followed the last answer
//! 3. username prompt, answered with the username
//! 4. password prompt, answered with the password
//! 5. yes/no confirmation, answered with `yes` when auto-confirm is on
//!
//! A device prompt wins over any marker, so post-login banners such as
//! "Unauthorized access denied" do not reject a successful login.
//!
//! A challenge is only answered again once the device has printed something
//! new, so a slow device never receives the same answer twice. When nothing
//! matches for a nudge interval a bare newline is sent.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::config::RunnerConfig;
use super::error::RunnerError;
use super::poll::{Deadline, Stability, Step, poll_until};
use super::terminal::{TerminalBuffer, TerminalInput};
use super::types::Credential;

static FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(authentication failed|access denied|login incorrect|login failed|permission denied|invalid password|incorrect password)",
    )
    .expect("FAILURE is a valid pattern")
});
static USERNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(user\s*name|login(\s+name)?|user|account)\s*:\s*$")
        .expect("USERNAME is a valid pattern")
});
static PASSWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)pass(word|phrase)(\s+for\s+\S.*?)?\s*:?\s*$")
        .expect("PASSWORD is a valid pattern")
});
static CONFIRM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\((yes/no|y/n)(/\[fingerprint\])?\)\s*\??|are\s+you\s+sure.*\?|confirm.*\?)\s*:?\s*$")
        .expect("CONFIRM is a valid pattern")
});
static DEVICE_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\w\-.@~/:\])]\s?[#>$%]\s*$").expect("DEVICE_PROMPT is a valid pattern")
});

/// What the last screen line is asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Failure(String),
    Username,
    Password,
    Confirm,
    Prompt(String),
    Unknown,
}

/// Classify a screen.
///
/// Failure markers are searched in `since_answer` only, the output that
/// followed the last credential written.
pub fn classify(screen: &str, since_answer: Option<&str>, auto_confirm: bool) -> Challenge {
    let last = screen.lines().rev().map(str::trim).find(|l| !l.is_empty());
    let asks_credential = last.is_some_and(|l| USERNAME.is_match(l) || PASSWORD.is_match(l));

    if let Some(line) = last
        && !asks_credential
        && DEVICE_PROMPT.is_match(line)
    {
        return Challenge::Prompt(line.to_string());
    }
    if let Some(found) = since_answer.and_then(|text| FAILURE.find(text)) {
        return Challenge::Failure(found.as_str().to_string());
    }

    let Some(last) = last else {
        return Challenge::Unknown;
    };
    // "password for user:" must not read as a username challenge
    if USERNAME.is_match(last) && !PASSWORD.is_match(last) {
        Challenge::Username
    } else if PASSWORD.is_match(last) {
        Challenge::Password
    } else if auto_confirm && CONFIRM.is_match(last) {
        Challenge::Confirm
    } else {
        Challenge::Unknown
    }
}

/// Whether the screen ends in a username or password challenge.
pub fn needs_login(screen: &str) -> bool {
    matches!(
        classify(screen, None, false),
        Challenge::Username | Challenge::Password
    )
}

/// Drives one shell-level login exchange.
#[derive(Debug, Clone)]
pub struct LoginSequencer {
    username: String,
    password: Option<SecretString>,
    auto_confirm: bool,
    poll_interval: Duration,
    nudge_after: Duration,
    timeout: Duration,
}

impl LoginSequencer {
    pub fn new(credential: &Credential, config: &RunnerConfig) -> Self {
        Self {
            username: credential.username().to_string(),
            password: credential.password().cloned(),
            auto_confirm: config.auto_confirm,
            poll_interval: config.poll_interval,
            nudge_after: config.login_nudge,
            timeout: config.login_timeout,
        }
    }

    /// Answer challenges until a device prompt shows up.
    ///
    /// Returns the prompt line that ended the exchange. Bounded by the login
    /// timeout and by `outer`, whichever ends first.
    pub async fn run(
        &self,
        buffer: &TerminalBuffer,
        input: &dyn TerminalInput,
        outer: &Deadline,
    ) -> Result<String, RunnerError> {
        let deadline = outer.child(self.timeout);
        let mut answered_at: Option<usize> = None;
        let mut answer_mark: Option<usize> = None;
        let mut stability = Stability::new(buffer.len());
        let mut responses = 0usize;

        let outcome = poll_until(input, self.poll_interval, &deadline, || {
            let len = buffer.len();
            let quiet_for = stability.observe(len);

            let fresh = answered_at.is_none_or(|at| len > at);
            if fresh {
                let since_answer = answer_mark.map(|mark| buffer.text_since(mark));
                match classify(&buffer.screen(), since_answer.as_deref(), self.auto_confirm) {
                    Challenge::Failure(marker) => {
                        return Step::Done(Err(RunnerError::LoginRejected(marker)));
                    }
                    Challenge::Username => {
                        debug!("Answering username challenge");
                        answered_at = Some(len);
                        answer_mark = Some(buffer.mark());
                        responses += 1;
                        return Step::Send(line_bytes(&self.username));
                    }
                    Challenge::Password => {
                        let Some(password) = &self.password else {
                            return Step::Done(Err(RunnerError::LoginRejected(
                                "password prompt but no password credential".to_string(),
                            )));
                        };
                        debug!("Answering password challenge");
                        answered_at = Some(len);
                        answer_mark = Some(buffer.mark());
                        responses += 1;
                        return Step::Send(line_bytes(password.expose_secret()));
                    }
                    Challenge::Confirm => {
                        debug!("Answering confirmation challenge");
                        answered_at = Some(len);
                        answer_mark = Some(buffer.mark());
                        responses += 1;
                        return Step::Send(line_bytes("yes"));
                    }
                    Challenge::Prompt(line) => return Step::Done(Ok(line)),
                    Challenge::Unknown => {}
                }
            }

            if quiet_for >= self.nudge_after {
                debug!("No login challenge recognised, nudging");
                stability.restart(len);
                return Step::Send(b"\n".to_vec());
            }
            Step::Continue
        })
        .await?;

        match outcome {
            Some(Ok(prompt)) => {
                info!(responses, prompt = %prompt, "Shell login completed");
                Ok(prompt)
            }
            Some(Err(err)) => {
                warn!(error = %err, "Shell login rejected");
                Err(err)
            }
            None => {
                warn!(timeout = ?self.timeout, "Shell login timed out");
                Err(RunnerError::LoginTimeout(self.timeout))
            }
        }
    }
}

fn line_bytes(line: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.push(b'\n');
    data
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    mod classification {
        use super::*;

        #[test]
        fn test_username_variants() {
            for screen in ["Username:", "login: ", "User Name :", "Login name:", "Account:"] {
                assert_eq!(classify(screen, None, false), Challenge::Username, "{screen}");
            }
        }

        #[test]
        fn test_password_variants() {
            for screen in [
                "Password:",
                "password",
                "[sudo] password for bob:",
                "bob@host's password: ",
                "Enter passphrase for key:",
                "[sudo] password for user:",
            ] {
                assert_eq!(classify(screen, None, false), Challenge::Password, "{screen}");
            }
        }

        #[test]
        fn test_confirm_only_with_auto_confirm() {
            for screen in ["Continue connecting (yes/no)?", "Proceed with reload? (y/n)", "Are you sure?"] {
                assert_eq!(classify(screen, None, true), Challenge::Confirm, "{screen}");
                assert_eq!(classify(screen, None, false), Challenge::Unknown, "{screen}");
            }
        }

        #[test]
        fn test_failure_only_after_response() {
            let screen = "Access denied\nUsername:";
            assert_eq!(classify(screen, None, false), Challenge::Username);
            assert_eq!(
                classify(screen, Some(screen), false),
                Challenge::Failure("Access denied".to_string())
            );
        }

        #[test]
        fn test_prompt_wins_over_banner_marker() {
            let screen = "*** Unauthorized access denied. Activity is logged ***\nsw1#";
            assert_eq!(
                classify(screen, Some(screen), false),
                Challenge::Prompt("sw1#".to_string())
            );
        }

        #[test]
        fn test_marker_before_answer_ignored() {
            let screen = "Access denied to guests\nUsername: admin\nPassword:";
            assert_eq!(
                classify(screen, Some("admin\nPassword:"), false),
                Challenge::Password
            );
        }

        #[test]
        fn test_device_prompt() {
            assert_eq!(
                classify("banner\nrouter1# ", None, false),
                Challenge::Prompt("router1#".to_string())
            );
            assert_eq!(
                classify("[ops@web ~]$", None, false),
                Challenge::Prompt("[ops@web ~]$".to_string())
            );
        }

        #[test]
        fn test_needs_login() {
            assert!(needs_login("Welcome\nUsername: "));
            assert!(needs_login("Password:"));
            assert!(!needs_login("user@host:~$"));
            assert!(!needs_login(""));
        }
    }

    mod sequencing {
        use super::*;

        /// Scripted device: each write pops the next reply into the buffer.
        struct ScriptedLogin {
            buffer: TerminalBuffer,
            replies: Mutex<Vec<&'static str>>,
            writes: Mutex<Vec<String>>,
        }

        impl ScriptedLogin {
            fn new(buffer: &TerminalBuffer, replies: &[&'static str]) -> Self {
                let mut replies = replies.to_vec();
                replies.reverse();
                Self {
                    buffer: buffer.clone(),
                    replies: Mutex::new(replies),
                    writes: Mutex::new(Vec::new()),
                }
            }
        }

        #[async_trait]
        impl TerminalInput for ScriptedLogin {
            async fn send(&self, data: &[u8]) -> Result<(), RunnerError> {
                self.writes
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(data).into_owned());
                if let Some(reply) = self.replies.lock().unwrap().pop() {
                    self.buffer.append(reply.as_bytes());
                }
                Ok(())
            }
        }

        fn sequencer(password: Option<&str>) -> LoginSequencer {
            let credential = match password {
                Some(pw) => Credential::with_password("sw1", 22, "admin", pw).unwrap(),
                None => Credential::with_private_key("sw1", 22, "admin", "KEY", None).unwrap(),
            };
            LoginSequencer::new(&credential, &RunnerConfig::default())
        }

        #[tokio::test(start_paused = true)]
        async fn test_username_then_password() {
            let buffer = TerminalBuffer::new(24);
            buffer.append(b"User Access Verification\r\n\r\nUsername: ");
            let device = ScriptedLogin::new(&buffer, &["admin\r\nPassword: ", "\r\nsw1>"]);
            let deadline = Deadline::after(Duration::from_secs(10));

            let prompt = sequencer(Some("s3cret")).run(&buffer, &device, &deadline).await.unwrap();

            assert_eq!(prompt, "sw1>");
            assert_eq!(
                device.writes.lock().unwrap().as_slice(),
                &["admin\n".to_string(), "s3cret\n".to_string()]
            );
        }

        #[tokio::test(start_paused = true)]
        async fn test_failure_marker_rejects() {
            let buffer = TerminalBuffer::new(24);
            buffer.append(b"Password: ");
            let device = ScriptedLogin::new(&buffer, &["\r\n% Login incorrect\r\nPassword: "]);
            let deadline = Deadline::after(Duration::from_secs(10));

            let err = sequencer(Some("bad")).run(&buffer, &device, &deadline).await.unwrap_err();
            assert!(matches!(err, RunnerError::LoginRejected(ref m) if m == "Login incorrect"));
            assert!(err.is_authentication());
        }

        #[tokio::test(start_paused = true)]
        async fn test_post_login_banner_is_not_rejection() {
            let buffer = TerminalBuffer::new(24);
            buffer.append(b"Username: ");
            let device = ScriptedLogin::new(
                &buffer,
                &[
                    "admin\r\nPassword: ",
                    "\r\n*** Unauthorized access denied. Activity is logged ***\r\nsw1#",
                ],
            );
            let deadline = Deadline::after(Duration::from_secs(10));

            let prompt = sequencer(Some("s3cret")).run(&buffer, &device, &deadline).await.unwrap();
            assert_eq!(prompt, "sw1#");
        }

        #[tokio::test(start_paused = true)]
        async fn test_pre_login_banner_is_not_rejection() {
            let buffer = TerminalBuffer::new(24);
            buffer.append(b"Access denied to unauthorized users\r\nUsername: ");
            let device = ScriptedLogin::new(&buffer, &["admin\r\nPassword: ", "\r\nsw1>"]);
            let deadline = Deadline::after(Duration::from_secs(10));

            let prompt = sequencer(Some("s3cret")).run(&buffer, &device, &deadline).await.unwrap();
            assert_eq!(prompt, "sw1>");
            assert_eq!(device.writes.lock().unwrap().len(), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn test_password_prompt_without_password() {
            let buffer = TerminalBuffer::new(24);
            buffer.append(b"Password: ");
            let device = ScriptedLogin::new(&buffer, &[]);
            let deadline = Deadline::after(Duration::from_secs(10));

            let err = sequencer(None).run(&buffer, &device, &deadline).await.unwrap_err();
            assert!(matches!(err, RunnerError::LoginRejected(_)));
            assert!(device.writes.lock().unwrap().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_same_challenge_not_answered_twice() {
            let buffer = TerminalBuffer::new(24);
            buffer.append(b"Username: ");
            // device swallows the answer and never prints anything else
            let device = ScriptedLogin::new(&buffer, &[]);
            let deadline = Deadline::after(Duration::from_secs(30));

            let err = sequencer(Some("pw")).run(&buffer, &device, &deadline).await.unwrap_err();
            assert_eq!(err, RunnerError::LoginTimeout(Duration::from_secs(10)));
            let writes = device.writes.lock().unwrap();
            assert_eq!(writes.iter().filter(|w| w.as_str() == "admin\n").count(), 1);
            // the silence after the answer is nudged
            assert!(writes.iter().any(|w| w == "\n"));
        }

        #[tokio::test(start_paused = true)]
        async fn test_nudge_provokes_prompt() {
            let buffer = TerminalBuffer::new(24);
            buffer.append(b"Press RETURN to get started");
            let device = ScriptedLogin::new(&buffer, &["\r\nrouter>"]);
            let deadline = Deadline::after(Duration::from_secs(10));

            let prompt = sequencer(Some("pw")).run(&buffer, &device, &deadline).await.unwrap();
            assert_eq!(prompt, "router>");
            assert_eq!(device.writes.lock().unwrap().as_slice(), &["\n".to_string()]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_login_bounded_by_outer_deadline() {
            let buffer = TerminalBuffer::new(24);
            buffer.append(b"Username: ");
            let device = ScriptedLogin::new(&buffer, &[]);
            let outer = Deadline::after(Duration::from_secs(3));

            let err = sequencer(Some("pw")).run(&buffer, &device, &outer).await.unwrap_err();
            assert!(matches!(err, RunnerError::LoginTimeout(_)));
            assert!(outer.elapsed() <= Duration::from_millis(3200));
        }
    }
}
