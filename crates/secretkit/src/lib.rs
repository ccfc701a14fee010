//! # secretkit
//!
//! Secret values for declared resource props, and a stage-scoped vault that
//! keeps them encrypted at rest.
//!
//! A [`Secret`] serializes as a `{"__secret__": "<plaintext>"}` marker while
//! it lives in memory. Before a JSON value is persisted, [`Vault::seal_value`]
//! rewrites every marker to hold AES-256-GCM ciphertext instead; after it is
//! read back, [`Vault::open_value`] restores the plaintext.
//!
//! ## Example
//!
//! ```
//! use secretkit::{Secret, Vault};
//! use serde_json::json;
//!
//! let vault = Vault::from_key(Vault::generate_key(), "dev");
//! let props = json!({ "user": "admin", "password": Secret::new("hunter2") });
//!
//! let at_rest = vault.seal_value(&props)?;
//! assert!(!at_rest.to_string().contains("hunter2"));
//! assert_eq!(vault.open_value(&at_rest)?, props);
//! # Ok::<(), secretkit::Error>(())
//! ```

#![warn(missing_docs)]

mod error;
mod secret;
mod vault;

pub use error::{Error, Result};
pub use secret::{SECRET_MARKER, Secret};
pub use vault::{KEY_SIZE, Vault, contains_secrets};
