//! Project-scoped encrypted secrets vault.
//!
//! Values are sealed with AES-256-GCM under a per-installation key; each
//! entry stores `nonce || ciphertext` base64-encoded. Secrets are injected
//! into deployed processes as environment variables at launch time.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::error::{Error, Result};
use crate::store::Store;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Mask shown for entries whose ciphertext no longer decrypts.
const UNDECRYPTABLE_MASK: &str = "********";

/// A secret as exposed to listing callers: value masked, never plaintext.
#[derive(Debug, Clone)]
pub struct MaskedSecret {
    pub id: i64,
    pub project_id: i64,
    pub key_name: String,
    pub masked_value: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Encrypted key/value store scoped to projects.
pub struct Vault {
    store: Store,
    cipher: Aes256Gcm,
}

impl Vault {
    /// Create a vault over `store` with the given key material. The material
    /// is zero-padded or truncated to the 32 bytes AES-256 needs.
    pub fn new(store: Store, key_material: &str) -> Self {
        let mut key = [0u8; 32];
        let bytes = key_material.as_bytes();
        let n = bytes.len().min(32);
        key[..n].copy_from_slice(&bytes[..n]);

        Self {
            store,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn decrypt(&self, encoded: &str) -> Result<String> {
        let data = BASE64
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("malformed ciphertext encoding: {}", e)))?;

        if data.len() < NONCE_LEN {
            return Err(Error::Crypto("ciphertext shorter than nonce".to_string()));
        }

        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::Crypto("decrypted value is not UTF-8".to_string()))
    }

    /// Store a new secret. Fails with a conflict when `(project, key)` exists.
    pub async fn put(
        &self,
        project_id: i64,
        key_name: &str,
        value: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        validate_entry(key_name, value)?;
        let encrypted = self.encrypt(value)?;
        self.store
            .insert_secret(project_id, key_name, &encrypted, description)
            .await
    }

    /// Replace an existing secret's key, value, and description.
    pub async fn update(
        &self,
        secret_id: i64,
        project_id: i64,
        key_name: &str,
        value: &str,
        description: Option<&str>,
    ) -> Result<()> {
        validate_entry(key_name, value)?;
        let encrypted = self.encrypt(value)?;
        self.store
            .update_secret(secret_id, project_id, key_name, &encrypted, description)
            .await
    }

    pub async fn delete(&self, secret_id: i64, project_id: i64) -> Result<()> {
        self.store.delete_secret(secret_id, project_id).await
    }

    /// Decrypt and return a single secret's plaintext value.
    pub async fn get_value(&self, secret_id: i64, project_id: i64) -> Result<String> {
        let row = self.store.get_secret(secret_id, project_id).await?;
        self.decrypt(&row.encrypted_value)
    }

    /// List a project's secrets with masked values, ordered by key.
    pub async fn list(&self, project_id: i64) -> Result<Vec<MaskedSecret>> {
        let rows = self.store.list_secrets(project_id).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let plaintext = match self.decrypt(&row.encrypted_value) {
                Ok(v) => v,
                Err(_) => UNDECRYPTABLE_MASK.to_string(),
            };
            out.push(MaskedSecret {
                id: row.id,
                project_id: row.project_id,
                key_name: row.key_name,
                masked_value: mask_value(&plaintext),
                description: row.description,
                created_at: row.created_at,
                updated_at: row.updated_at,
            });
        }
        Ok(out)
    }

    /// Decrypted key -> value map for environment injection at launch time.
    ///
    /// An entry that fails to decrypt is skipped with a warning rather than
    /// failing the whole deployment.
    pub async fn deployment_env(&self, project_id: i64) -> Result<HashMap<String, String>> {
        let rows = self.store.list_secrets(project_id).await?;
        let mut env = HashMap::with_capacity(rows.len());
        for row in rows {
            match self.decrypt(&row.encrypted_value) {
                Ok(value) => {
                    env.insert(row.key_name, value);
                }
                Err(e) => {
                    tracing::warn!(
                        "Skipping secret '{}' for project {}: {}",
                        row.key_name,
                        project_id,
                        e
                    );
                }
            }
        }
        Ok(env)
    }
}

fn validate_entry(key_name: &str, value: &str) -> Result<()> {
    if key_name.is_empty() {
        return Err(Error::Validation("secret key name is required".to_string()));
    }
    if value.is_empty() {
        return Err(Error::Validation("secret value is required".to_string()));
    }
    Ok(())
}

/// Mask a secret for display: values of length <= 4 are fully masked, longer
/// values show only the trailing 4 characters.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        "*".repeat(chars.len())
    } else {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}", "*".repeat(chars.len() - 4), tail)
    }
}
