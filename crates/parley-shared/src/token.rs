//! Stateless session tokens.
//!
//! A token is `base64url(claims_json) "." base64url(signature)` where the
//! signature is an Ed25519 signature over the exact claims bytes. The server
//! keeps no record of issued tokens; any holder of the verifying key can check
//! one independently.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::constants::TOKEN_IAT_SKEW_SECS;
use crate::error::TokenError;
use crate::types::Identity;

/// Claims embedded in every session token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct SessionClaims {
    /// Username. Kept as a raw string so that a signed but ill-formed name
    /// is reported as `Invalid` rather than `Malformed`.
    sub: String,
    /// Issued-at (Unix timestamp, seconds).
    iat: i64,
    /// Expiry (Unix timestamp, seconds).
    exp: i64,
}

/// Issues and verifies signed, time-bound identity tokens.
#[derive(Clone)]
pub struct TokenService {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    ttl: Duration,
}

impl TokenService {
    /// Build a service from a 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8; 32], ttl: Duration) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
            ttl,
        }
    }

    /// Build a service with a fresh random key. Tokens issued by it do not
    /// survive a process restart.
    pub fn generate(ttl: Duration) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_seed(signing_key.as_bytes(), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for an identity that has already passed credential
    /// verification.
    pub fn issue(&self, identity: &Identity) -> String {
        self.issue_at(identity, Utc::now())
    }

    pub fn issue_at(&self, identity: &Identity, now: DateTime<Utc>) -> String {
        let iat = now.timestamp();
        let claims = SessionClaims {
            sub: identity.as_str().to_string(),
            iat,
            exp: iat + self.ttl.num_seconds(),
        };
        self.encode(&claims)
    }

    pub fn verify(&self, token: &str) -> Result<Identity, TokenError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify a token against an explicit clock.
    ///
    /// The signature is checked before any claim is inspected, so `Expired`
    /// and `Invalid` are only ever reported for authentic tokens.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Identity, TokenError> {
        let (payload_b64, signature_b64) =
            token.trim().split_once('.').ok_or(TokenError::Malformed)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| TokenError::Malformed)?;

        self.verifying_key
            .verify_strict(&payload, &signature)
            .map_err(|_| TokenError::Malformed)?;

        let claims: SessionClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        let now = now.timestamp();
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }
        if claims.exp <= claims.iat || claims.iat > now + TOKEN_IAT_SKEW_SECS {
            return Err(TokenError::Invalid);
        }

        Identity::new(claims.sub).map_err(|_| TokenError::Invalid)
    }

    fn encode(&self, claims: &SessionClaims) -> String {
        // Serializing a struct of a String and two integers cannot fail.
        let payload = serde_json::to_vec(claims).unwrap_or_default();
        let signature = self.signing_key.sign(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("verifying_key", &self.verifying_key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
