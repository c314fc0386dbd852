//! Hand-off of verified credentials to storage
//!
//! Storage never receives the secret itself, only an argon2 digest in
//! PHC string format that lets it recognise the same secret later.

use crate::error::{Error, Result};
use crate::secret::Secret;
use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use serde::Serialize;

/// What storage learns about a verified account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedCredential {
    pub email: String,
    pub provider_id: String,
    /// Argon2id PHC string.
    pub secret_digest: String,
}

#[async_trait]
pub trait CredentialSink: Send + Sync {
    /// Persist a verified credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential cannot be stored.
    async fn store(&self, credential: VerifiedCredential) -> Result<()>;
}

/// Argon2id digest of `secret` with a random salt.
///
/// # Errors
///
/// Returns a credential error if hashing fails.
pub fn digest_secret(secret: &Secret) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.expose().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Credential(e.to_string()))
}

/// Whether `secret` matches a digest produced by [`digest_secret`].
///
/// # Errors
///
/// Returns a credential error if `digest` is not a PHC string.
pub fn digest_matches(secret: &Secret, digest: &str) -> Result<bool> {
    let parsed = PasswordHash::new(digest).map_err(|e| Error::Credential(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(secret.expose().as_bytes(), &parsed)
        .is_ok())
}
