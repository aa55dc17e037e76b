//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::runner::client::SessionHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) so a connector can
/// hold one across retries and tasks.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - Credentials rejected
    /// * `Err(message)` - The attempt itself failed (bad key material, transport error)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SessionHandler>,
        username: &str,
    ) -> Result<bool, String>;

    /// Name of this strategy, for logging.
    fn name(&self) -> &'static str;
}
