//! Username/password verification.
//!
//! Passwords are held only as Argon2id PHC strings, hashed once at startup
//! from the configured accounts.

use std::collections::HashMap;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use parley_shared::error::IdentityError;
use parley_shared::types::Identity;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid username '{username}': {source}")]
    InvalidUsername {
        username: String,
        source: IdentityError,
    },

    #[error("Password hashing failed: {0}")]
    Hashing(String),
}

pub struct CredentialStore {
    hashes: HashMap<Identity, String>,
    /// Verified against for unknown usernames so a miss costs as much as a
    /// wrong password.
    dummy_hash: String,
}

impl CredentialStore {
    pub fn from_users(users: &[(String, String)]) -> Result<Self, CredentialError> {
        let mut hashes = HashMap::with_capacity(users.len());
        for (username, password) in users {
            let identity =
                Identity::new(username.as_str()).map_err(|source| CredentialError::InvalidUsername {
                    username: username.clone(),
                    source,
                })?;
            hashes.insert(identity, hash_password(password)?);
        }

        info!(accounts = hashes.len(), "Credential store initialized");

        Ok(Self {
            hashes,
            dummy_hash: hash_password("parley-dummy-password")?,
        })
    }

    /// Check a username/password pair and return the identity claim on
    /// success. CPU-bound; call from a blocking context.
    pub fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Identity, CredentialError> {
        let found = Identity::new(username)
            .ok()
            .and_then(|identity| self.hashes.get_key_value(&identity));

        let (identity, stored) = match found {
            Some((identity, hash)) => (Some(identity), hash.as_str()),
            None => (None, self.dummy_hash.as_str()),
        };

        let parsed = PasswordHash::new(stored)
            .map_err(|e| CredentialError::Hashing(e.to_string()))?;
        let password_ok = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();

        match identity {
            Some(identity) if password_ok => Ok(identity.clone()),
            _ => {
                debug!(username = %username, "Credential check failed");
                Err(CredentialError::InvalidCredentials)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }
}

fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CredentialError::Hashing(e.to_string()))
}
