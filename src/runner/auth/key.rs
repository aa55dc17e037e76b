//! Private key SSH authentication from in-memory key material.
//!
//! The key text is written to a transient file with normalized line
//! endings, loaded (decrypting with the passphrase when one is given) and
//! the file is removed when the guard drops, whatever the outcome.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use secrecy::{ExposeSecret, SecretString};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::runner::client::SessionHandler;

use super::traits::AuthStrategy;

/// Private key authentication strategy.
pub struct KeyAuth {
    material: SecretString,
    passphrase: Option<SecretString>,
}

impl KeyAuth {
    pub fn new(material: SecretString, passphrase: Option<SecretString>) -> Self {
        Self {
            material,
            passphrase,
        }
    }

    /// Write the normalized key to a temporary file deleted on drop.
    fn materialize(&self) -> Result<NamedTempFile, String> {
        let mut file =
            NamedTempFile::new().map_err(|e| format!("Failed to create key file: {}", e))?;
        file.write_all(normalize_key(self.material.expose_secret()).as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| format!("Failed to write key file: {}", e))?;
        Ok(file)
    }

    fn load(&self) -> Result<keys::PrivateKey, String> {
        let file = self.materialize()?;
        let passphrase = self.passphrase.as_ref().map(|p| p.expose_secret());
        keys::load_secret_key(file.path(), passphrase)
            .map_err(|e| format!("Failed to load private key: {}", e))
        // `file` drops here and removes the key material
    }
}

/// Convert CRLF and bare CR line endings to LF and end with a newline.
pub(crate) fn normalize_key(material: &str) -> String {
    let mut key = material.trim().replace("\r\n", "\n").replace('\r', "\n");
    key.push('\n');
    key
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SessionHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let key_pair = self.load()?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_auth_name() {
        let auth = KeyAuth::new(SecretString::from("KEY"), None);
        assert_eq!(auth.name(), "key");
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_key("a\r\nb\rc\n"), "a\nb\nc\n");
        assert_eq!(normalize_key("  -----BEGIN-----\r\n"), "-----BEGIN-----\n");
    }

    #[test]
    fn test_materialized_file_removed_on_drop() {
        let auth = KeyAuth::new(SecretString::from("line1\r\nline2"), None);
        let file = auth.materialize().unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line1\nline2\n");
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_invalid_key_fails_to_load() {
        let auth = KeyAuth::new(SecretString::from("not a key"), None);
        let err = auth.load().unwrap_err();
        assert!(err.contains("Failed to load private key"));
    }
}
