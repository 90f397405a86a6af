//! Error type shared by every identity operation.

use identity_common::{DeadlineExceeded, Retryable};
use thiserror::Error;

use crate::jwt::TokenType;
use crate::storage::StorageCategory;

/// Every failure the identity service reports.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Missing or invalid setting.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Key file unreadable or not a usable PEM key.
    #[error("Key load error: {0}")]
    KeyLoad(String),

    /// Explicit algorithm does not fit the key type.
    #[error("Signing algorithm {algorithm} cannot be used with {key_type} key")]
    AlgorithmMismatch {
        /// Configured algorithm name
        algorithm: String,
        /// Family of the loaded key
        key_type: String,
    },

    /// Not a well-formed compact token.
    #[error("Token malformed: {0}")]
    TokenMalformed(String),

    /// Signature does not verify with the public key.
    #[error("Token signature invalid")]
    TokenSignatureInvalid,

    /// Token is past its `exp`.
    #[error("Token expired")]
    TokenExpired,

    /// Token is of another type than required.
    #[error("Token type mismatch: expected {expected}, got {actual}")]
    TokenTypeMismatch {
        /// Type the caller required
        expected: TokenType,
        /// Type the token carries
        actual: TokenType,
    },

    /// Token was minted by another issuer.
    #[error("Token issuer mismatch")]
    TokenIssuerMismatch,

    /// Token was minted for another app.
    #[error("Token audience mismatch")]
    TokenAudienceMismatch,

    /// Refresh record missing or revoked.
    #[error("Token revoked")]
    TokenRevoked,

    /// A rotated refresh token was presented again.
    #[error("Token reused - replay detected")]
    TokenReused,

    /// No app has this id.
    #[error("App not found")]
    AppNotFound,

    /// App exists but is disabled.
    #[error("App inactive")]
    AppInactive,

    /// An app with this id exists.
    #[error("App already exists")]
    AppAlreadyExists,

    /// No user has this id or email.
    #[error("User not found")]
    UserNotFound,

    /// User exists but is disabled.
    #[error("User inactive")]
    UserInactive,

    /// Unknown user or wrong password, deliberately indistinguishable.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Another user holds this username.
    #[error("Username already taken")]
    UsernameTaken,

    /// Another user holds this email.
    #[error("Email already taken")]
    EmailTaken,

    /// No requested scope may be granted.
    #[error("Requested scopes are not allowed")]
    ScopeNotAllowed,

    /// Refresh requested from an app without offline access.
    #[error("App does not allow offline access")]
    OfflineNotAllowed,

    /// Wrong, expired or already used code.
    #[error("Verification code invalid")]
    VerificationCodeInvalid,

    /// Backend failed or timed out.
    #[error("Storage unavailable during {operation}: {reason}")]
    StorageUnavailable {
        /// Storage call that failed
        operation: &'static str,
        /// Backend error text
        reason: String,
    },

    /// Partial composition left a category without a backend.
    #[error("No storage configured for {0}")]
    UnconfiguredStorage(StorageCategory),

    /// Invariant broken inside the service.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias used across the crate.
pub type IdentityResult<T> = Result<T, IdentityError>;

impl IdentityError {
    /// Shorthand for [`IdentityError::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Shorthand for [`IdentityError::KeyLoad`].
    pub fn key_load(msg: impl Into<String>) -> Self {
        Self::KeyLoad(msg.into())
    }

    /// Shorthand for [`IdentityError::TokenMalformed`].
    pub fn malformed(msg: impl std::fmt::Display) -> Self {
        Self::TokenMalformed(msg.to_string())
    }

    /// Wrap a backend failure with the storage operation it interrupted.
    pub fn storage(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`IdentityError::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine readable code for boundary mapping.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => CONFIGURATION_ERROR,
            Self::KeyLoad(_) => KEY_LOAD_ERROR,
            Self::AlgorithmMismatch { .. } => ALGORITHM_MISMATCH,
            Self::TokenMalformed(_) => TOKEN_MALFORMED,
            Self::TokenSignatureInvalid => TOKEN_SIGNATURE_INVALID,
            Self::TokenExpired => TOKEN_EXPIRED,
            Self::TokenTypeMismatch { .. } => TOKEN_TYPE_MISMATCH,
            Self::TokenIssuerMismatch => TOKEN_ISSUER_MISMATCH,
            Self::TokenAudienceMismatch => TOKEN_AUDIENCE_MISMATCH,
            Self::TokenRevoked => TOKEN_REVOKED,
            Self::TokenReused => TOKEN_REUSED,
            Self::AppNotFound => APP_NOT_FOUND,
            Self::AppInactive => APP_INACTIVE,
            Self::AppAlreadyExists => APP_ALREADY_EXISTS,
            Self::UserNotFound => USER_NOT_FOUND,
            Self::UserInactive => USER_INACTIVE,
            Self::InvalidCredentials => INVALID_CREDENTIALS,
            Self::UsernameTaken => USERNAME_TAKEN,
            Self::EmailTaken => EMAIL_TAKEN,
            Self::ScopeNotAllowed => SCOPE_NOT_ALLOWED,
            Self::OfflineNotAllowed => OFFLINE_NOT_ALLOWED,
            Self::VerificationCodeInvalid => VERIFICATION_CODE_INVALID,
            Self::StorageUnavailable { .. } => STORAGE_UNAVAILABLE,
            Self::UnconfiguredStorage(_) => UNCONFIGURED_STORAGE,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Denials a caller can render to the end user, as opposed to startup
    /// or infrastructure failures.
    #[must_use]
    pub const fn is_token_denial(&self) -> bool {
        matches!(
            self,
            Self::TokenMalformed(_)
                | Self::TokenSignatureInvalid
                | Self::TokenExpired
                | Self::TokenTypeMismatch { .. }
                | Self::TokenIssuerMismatch
                | Self::TokenAudienceMismatch
                | Self::TokenRevoked
                | Self::TokenReused
        )
    }
}

impl Retryable for IdentityError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

impl From<DeadlineExceeded> for IdentityError {
    fn from(err: DeadlineExceeded) -> Self {
        Self::storage("deadline", err)
    }
}

/// Code of [`IdentityError::Configuration`].
pub const CONFIGURATION_ERROR: &str = "CONFIGURATION_ERROR";
/// Code of [`IdentityError::KeyLoad`].
pub const KEY_LOAD_ERROR: &str = "KEY_LOAD_ERROR";
/// Code of [`IdentityError::AlgorithmMismatch`].
pub const ALGORITHM_MISMATCH: &str = "ALGORITHM_MISMATCH";
/// Code of [`IdentityError::TokenMalformed`].
pub const TOKEN_MALFORMED: &str = "TOKEN_MALFORMED";
/// Code of [`IdentityError::TokenSignatureInvalid`].
pub const TOKEN_SIGNATURE_INVALID: &str = "TOKEN_SIGNATURE_INVALID";
/// Code of [`IdentityError::TokenExpired`].
pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
/// Code of [`IdentityError::TokenTypeMismatch`].
pub const TOKEN_TYPE_MISMATCH: &str = "TOKEN_TYPE_MISMATCH";
/// Code of [`IdentityError::TokenIssuerMismatch`].
pub const TOKEN_ISSUER_MISMATCH: &str = "TOKEN_ISSUER_MISMATCH";
/// Code of [`IdentityError::TokenAudienceMismatch`].
pub const TOKEN_AUDIENCE_MISMATCH: &str = "TOKEN_AUDIENCE_MISMATCH";
/// Code of [`IdentityError::TokenRevoked`].
pub const TOKEN_REVOKED: &str = "TOKEN_REVOKED";
/// Code of [`IdentityError::TokenReused`].
pub const TOKEN_REUSED: &str = "TOKEN_REUSED";
/// Code of [`IdentityError::AppNotFound`].
pub const APP_NOT_FOUND: &str = "APP_NOT_FOUND";
/// Code of [`IdentityError::AppInactive`].
pub const APP_INACTIVE: &str = "APP_INACTIVE";
/// Code of [`IdentityError::AppAlreadyExists`].
pub const APP_ALREADY_EXISTS: &str = "APP_ALREADY_EXISTS";
/// Code of [`IdentityError::UserNotFound`].
pub const USER_NOT_FOUND: &str = "USER_NOT_FOUND";
/// Code of [`IdentityError::UserInactive`].
pub const USER_INACTIVE: &str = "USER_INACTIVE";
/// Code of [`IdentityError::InvalidCredentials`].
pub const INVALID_CREDENTIALS: &str = "INVALID_CREDENTIALS";
/// Code of [`IdentityError::UsernameTaken`].
pub const USERNAME_TAKEN: &str = "USERNAME_TAKEN";
/// Code of [`IdentityError::EmailTaken`].
pub const EMAIL_TAKEN: &str = "EMAIL_TAKEN";
/// Code of [`IdentityError::ScopeNotAllowed`].
pub const SCOPE_NOT_ALLOWED: &str = "SCOPE_NOT_ALLOWED";
/// Code of [`IdentityError::OfflineNotAllowed`].
pub const OFFLINE_NOT_ALLOWED: &str = "OFFLINE_NOT_ALLOWED";
/// Code of [`IdentityError::VerificationCodeInvalid`].
pub const VERIFICATION_CODE_INVALID: &str = "VERIFICATION_CODE_INVALID";
/// Code of [`IdentityError::StorageUnavailable`].
pub const STORAGE_UNAVAILABLE: &str = "STORAGE_UNAVAILABLE";
/// Code of [`IdentityError::UnconfiguredStorage`].
pub const UNCONFIGURED_STORAGE: &str = "UNCONFIGURED_STORAGE";
/// Code of [`IdentityError::Internal`].
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
