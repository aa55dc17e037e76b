//! Running commands on remote targets over SSH.
//!
//! The module is organized bottom-up:
//!
//! - `ansi`: control-sequence filtering and terminal cooking
//! - `terminal`: shared capture buffer and the keystroke seam
//! - `poll`: deadlines and the bounded poll loop used by every detector
//! - `prompt`: shell prompt inference
//! - `login`: device-level username/password challenges
//! - `completion`: command completion scoring and pagination
//! - `auth`: password and private-key authentication strategies
//! - `client`: connecting and authenticating sessions, with retry
//! - `shell` / `exec`: the two channel runners
//! - `race`: choosing between the runners for one command
//! - `config`: defaults, environment variables and per-call overrides

pub mod ansi;
pub(crate) mod auth;
pub mod client;
pub mod completion;
pub mod config;
pub mod error;
pub mod exec;
pub mod login;
pub mod poll;
pub mod prompt;
pub mod race;
pub mod shell;
pub mod terminal;
pub mod types;

pub use client::{Session, SessionConnector};
pub use config::{RunOverrides, RunnerConfig};
pub use error::RunnerError;
pub use race::ChannelRaceExecutor;
pub use types::{ChannelKind, CommandResult, Credential, PtyProfile, Secret};
