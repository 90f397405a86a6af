//! Argon2id password hashing shared by every user storage backend.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

use crate::error::{IdentityError, IdentityResult};

fn hasher() -> IdentityResult<Argon2<'static>> {
    // OWASP: m=19456 (19 MiB), t=2, p=1
    let params = argon2::Params::new(19456, 2, 1, None)
        .map_err(|e| IdentityError::internal(format!("argon2 params error: {e}")))?;
    Ok(Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params))
}

/// Hash `password` into a PHC string with a random salt.
///
/// # Errors
///
/// Returns `Internal` if hashing fails.
pub fn hash_password(password: &str) -> IdentityResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| IdentityError::internal(format!("password hash error: {e}")))?;
    Ok(hash.to_string())
}

/// Check `password` against a stored PHC string. A malformed or empty hash
/// never verifies.
#[must_use]
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

/// [`hash_password`] off the async executor.
pub async fn hash_password_blocking(password: String) -> IdentityResult<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| IdentityError::internal(format!("password hash task failed: {e}")))?
}

/// [`verify_password`] off the async executor.
pub async fn verify_password_blocking(password: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .unwrap_or(false)
}
