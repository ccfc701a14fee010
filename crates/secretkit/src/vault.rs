//! Stage-scoped symmetric encryption of secret markers inside JSON values.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use argon2::Argon2;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Error, Result};
use crate::secret::SECRET_MARKER;

/// Nonce size for AES-256-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (256 bits)
pub const KEY_SIZE: usize = 32;

/// Prefix of every sealed ciphertext, bumped if the format ever changes
const CIPHERTEXT_PREFIX: &str = "v1:";

/// Encrypts and decrypts secret markers with a key bound to one stage.
#[derive(Clone)]
pub struct Vault {
    stage: String,
    key: [u8; KEY_SIZE],
}

impl Vault {
    /// Create a vault from raw key material
    pub fn from_key(key: [u8; KEY_SIZE], stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            key,
        }
    }

    /// Derive the stage key from a passphrase with Argon2id.
    ///
    /// The stage name is part of the salt, so the same passphrase yields a
    /// different key for every stage.
    pub fn from_passphrase(passphrase: &str, stage: impl Into<String>) -> Result<Self> {
        let stage = stage.into();
        let salt = format!("converge/secretkit/{stage}");
        let mut key = [0u8; KEY_SIZE];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt.as_bytes(), &mut key)
            .map_err(|e| Error::KeyDerivation(e.to_string()))?;
        Ok(Self { stage, key })
    }

    /// Create a vault from a passphrase held in an environment variable.
    ///
    /// Returns `Ok(None)` when the variable is not set.
    pub fn from_env(var: &str, stage: impl Into<String>) -> Result<Option<Self>> {
        match std::env::var(var) {
            Ok(passphrase) => Self::from_passphrase(&passphrase, stage).map(Some),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(Error::Env {
                var: var.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Generate a fresh random key
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// The stage this vault's key belongs to
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Fail unless this vault was created for `stage`
    pub fn ensure_stage(&self, stage: &str) -> Result<()> {
        if self.stage == stage {
            Ok(())
        } else {
            Err(Error::StageMismatch {
                expected: self.stage.clone(),
                actual: stage.to_string(),
            })
        }
    }

    /// Encrypt a plaintext into the sealed string format
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Encrypt(format!("failed to create cipher: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Encrypt(e.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{CIPHERTEXT_PREFIX}{}", BASE64.encode(payload)))
    }

    /// Decrypt a string produced by [`Vault::encrypt`]
    pub fn decrypt(&self, sealed: &str) -> Result<String> {
        let encoded = sealed
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or_else(|| Error::Malformed("missing version prefix".to_string()))?;
        let payload = BASE64
            .decode(encoded)
            .map_err(|e| Error::Malformed(format!("invalid base64: {e}")))?;
        if payload.len() <= NONCE_SIZE {
            return Err(Error::Malformed("ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Decrypt(format!("failed to create cipher: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| Error::Decrypt(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Decrypt(format!("invalid UTF-8 in decrypted value: {e}")))
    }

    /// Replace the plaintext of every secret marker in `value` with ciphertext
    pub fn seal_value(&self, value: &Value) -> Result<Value> {
        map_markers(value, &mut |plaintext| self.encrypt(plaintext))
    }

    /// Replace the ciphertext of every secret marker in `value` with plaintext
    pub fn open_value(&self, value: &Value) -> Result<Value> {
        map_markers(value, &mut |sealed| self.decrypt(sealed))
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("stage", &self.stage)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Whether `value` contains at least one secret marker
pub fn contains_secrets(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            marker_payload(map).is_some() || map.values().any(contains_secrets)
        }
        Value::Array(items) => items.iter().any(contains_secrets),
        _ => false,
    }
}

fn marker_payload(map: &Map<String, Value>) -> Option<&str> {
    if map.len() != 1 {
        return None;
    }
    map.get(SECRET_MARKER)?.as_str()
}

fn map_markers<F>(value: &Value, f: &mut F) -> Result<Value>
where
    F: FnMut(&str) -> Result<String>,
{
    match value {
        Value::Object(map) => {
            if let Some(payload) = marker_payload(map) {
                let mut sealed = Map::with_capacity(1);
                sealed.insert(SECRET_MARKER.to_string(), Value::String(f(payload)?));
                return Ok(Value::Object(sealed));
            }
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), map_markers(item, f)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| map_markers(item, f))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Secret;
    use serde_json::json;

    fn vault() -> Vault {
        Vault::from_key(Vault::generate_key(), "dev")
    }

    #[test]
    fn test_encrypt_decrypt() {
        let vault = vault();
        let sealed = vault.encrypt("my-secret-password").unwrap();
        assert!(sealed.starts_with("v1:"));
        assert!(!sealed.contains("my-secret-password"));
        assert_eq!(vault.decrypt(&sealed).unwrap(), "my-secret-password");
    }

    #[test]
    fn test_rotated_key_fails() {
        let sealed = vault().encrypt("secret").unwrap();
        let err = vault().decrypt(&sealed).unwrap_err();
        assert!(matches!(err, Error::Decrypt(_)));
    }

    #[test]
    fn test_malformed_ciphertext() {
        assert!(matches!(
            vault().decrypt("plaintext").unwrap_err(),
            Error::Malformed(_)
        ));
        assert!(matches!(
            vault().decrypt("v1:AAAA").unwrap_err(),
            Error::Malformed(_)
        ));
    }

    #[test]
    fn test_seal_value_leaves_no_plaintext() {
        let vault = vault();
        let props = json!({
            "name": "db",
            "password": Secret::new("hunter2"),
            "replicas": [{ "token": Secret::new("t0k3n") }],
        });

        let sealed = vault.seal_value(&props).unwrap();
        let text = sealed.to_string();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("t0k3n"));
        assert_eq!(sealed["name"], "db");
        assert!(contains_secrets(&sealed));

        let opened = vault.open_value(&sealed).unwrap();
        assert_eq!(opened, props);
    }

    #[test]
    fn test_sealing_twice_differs_but_opens_equal() {
        let vault = vault();
        let props = json!({ "password": Secret::new("same") });
        let first = vault.seal_value(&props).unwrap();
        let second = vault.seal_value(&props).unwrap();
        assert_ne!(first, second);
        assert_eq!(
            vault.open_value(&first).unwrap(),
            vault.open_value(&second).unwrap()
        );
    }

    #[test]
    fn test_contains_secrets() {
        assert!(!contains_secrets(&json!({ "a": 1, "b": ["x"] })));
        assert!(contains_secrets(&json!([{ "__secret__": "x" }])));
        // A map with extra keys is not a marker
        assert!(!contains_secrets(&json!({ "__secret__": "x", "other": 1 })));
    }

    #[test]
    fn test_passphrase_is_stage_scoped() {
        let dev = Vault::from_passphrase("correct horse", "dev").unwrap();
        let prod = Vault::from_passphrase("correct horse", "prod").unwrap();
        let again = Vault::from_passphrase("correct horse", "dev").unwrap();

        let sealed = dev.encrypt("value").unwrap();
        assert_eq!(again.decrypt(&sealed).unwrap(), "value");
        assert!(prod.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_ensure_stage() {
        let vault = vault();
        assert!(vault.ensure_stage("dev").is_ok());
        assert!(matches!(
            vault.ensure_stage("prod"),
            Err(Error::StageMismatch { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", vault());
        assert!(debug.contains("<redacted>"));
        assert!(debug.contains("dev"));
    }
}
