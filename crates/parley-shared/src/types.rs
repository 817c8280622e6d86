use serde::{Deserialize, Serialize};

use crate::constants::MAX_USERNAME_CHARS;
use crate::error::IdentityError;

/// Identity claim: a validated username.
///
/// The only way to obtain one is through [`Identity::new`] (or deserializing,
/// which runs the same validation), so every `Identity` in the system is
/// well-formed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(username: impl Into<String>) -> Result<Self, IdentityError> {
        let username = username.into();
        if username.is_empty() {
            return Err(IdentityError::Empty);
        }
        let len = username.chars().count();
        if len > MAX_USERNAME_CHARS {
            return Err(IdentityError::TooLong {
                len,
                max: MAX_USERNAME_CHARS,
            });
        }
        if username
            .chars()
            .any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(IdentityError::InvalidCharacters);
        }
        Ok(Self(username))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
