//! Common types used throughout blocksync.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// A blockable user identity.
///
/// Identities are compared byte-for-byte after surrounding whitespace is
/// trimmed at construction time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Create a new Identity from a string.
    ///
    /// # Errors
    /// - Returns error if the trimmed value is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Identity cannot be empty".to_string(),
            ));
        }
        if trimmed.len() == id.len() {
            Ok(Self(id))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// API key for the remote list. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct Credential(String);

impl Credential {
    /// Wrap an API key.
    ///
    /// # Errors
    /// - Returns error if the key is blank
    pub fn new(key: impl Into<String>) -> crate::Result<Self> {
        let mut key = key.into();
        let trimmed = key.trim().to_string();
        key.zeroize();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput(
                "API key cannot be empty".to_string(),
            ));
        }
        Ok(Self(trimmed))
    }

    /// Get the raw key, for building request headers.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential([REDACTED])")
    }
}
