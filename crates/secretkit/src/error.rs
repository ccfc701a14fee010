//! Error types for secret sealing and opening.

use thiserror::Error;

/// Errors that can occur while wrapping, sealing, or opening secrets.
///
/// Every variant is fatal for the run that hit it: there is no fallback to
/// storing or reading plaintext.
#[derive(Debug, Error)]
pub enum Error {
    /// A value carries secrets but no vault key is configured for the stage
    #[error("no secret key configured for stage '{stage}'; set a passphrase to store secrets")]
    MissingKey {
        /// Stage whose key is missing
        stage: String,
    },

    /// The vault was created for a different stage than the one being run
    #[error("vault key belongs to stage '{expected}', not '{actual}'")]
    StageMismatch {
        /// Stage the vault key was derived for
        expected: String,
        /// Stage the caller tried to use it with
        actual: String,
    },

    /// Deriving the key from a passphrase failed
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Encryption failed
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// Decryption failed; the key is wrong or has been rotated
    #[error("could not decrypt secret (wrong or rotated key): {0}")]
    Decrypt(String),

    /// Stored ciphertext is not in a recognized format
    #[error("malformed secret ciphertext: {0}")]
    Malformed(String),

    /// The passphrase environment variable could not be read
    #[error("failed to read {var}: {message}")]
    Env {
        /// Environment variable name
        var: String,
        /// Underlying failure
        message: String,
    },
}

/// Result type for secret operations
pub type Result<T> = std::result::Result<T, Error>;
