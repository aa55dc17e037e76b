//! Authentication strategies for SSH connections.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: Private key material with optional passphrase

mod key;
mod password;
mod traits;

pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;

use super::types::Secret;

/// Pick the strategy matching a credential's secret.
pub fn strategy_for(secret: &Secret) -> Box<dyn AuthStrategy> {
    match secret {
        Secret::Password(password) => Box::new(PasswordAuth::new(password.clone())),
        Secret::PrivateKey {
            material,
            passphrase,
        } => Box::new(KeyAuth::new(material.clone(), passphrase.clone())),
    }
}
