//! The in-memory `Secret` value.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// JSON key marking a secret value.
///
/// In memory the marker holds plaintext; once sealed by a [`crate::Vault`] it
/// holds ciphertext.
pub const SECRET_MARKER: &str = "__secret__";

/// A sensitive value that must never be persisted or logged in plaintext.
///
/// Two secrets are equal when their plaintexts are equal, so props that
/// contain secrets still diff correctly across runs even though the sealed
/// ciphertext changes on every write (random nonce).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Secret(String);

impl Secret {
    /// Wrap a plaintext value
    pub fn new(plaintext: impl Into<String>) -> Self {
        Self(plaintext.into())
    }

    /// Reveal the plaintext. Only handler code should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the secret and return the plaintext
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(SECRET_MARKER, &self.0)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SecretVisitor;

        impl<'de> Visitor<'de> for SecretVisitor {
            type Value = Secret;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a map with a single '{SECRET_MARKER}' entry")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Secret, A::Error> {
                let mut value: Option<String> = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == SECRET_MARKER {
                        value = Some(map.next_value()?);
                    } else {
                        return Err(de::Error::unknown_field(&key, &[SECRET_MARKER]));
                    }
                }
                value
                    .map(Secret)
                    .ok_or_else(|| de::Error::missing_field(SECRET_MARKER))
            }
        }

        deserializer.deserialize_map(SecretVisitor)
    }
}
