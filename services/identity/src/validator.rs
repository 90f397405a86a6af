//! Request-time token checks.
//!
//! The validator needs neither storage nor the private key, so it can run
//! anywhere the public key is available.

use tracing::debug;

use crate::error::{IdentityError, IdentityResult};
use crate::jwt::{Token, TokenType};

/// Requirements of one validation point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    issuer: String,
    /// Empty accepts any audience
    audience: String,
    token_type: TokenType,
}

impl Validator {
    /// Checks for tokens of `token_type` issued by `issuer`. An empty `audience` accepts any.
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>, token_type: TokenType) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            token_type,
        }
    }

    /// Check `token` against the current time.
    ///
    /// # Errors
    ///
    /// See [`Validator::validate_at`].
    pub fn validate(&self, token: &Token) -> IdentityResult<()> {
        self.validate_at(token, chrono::Utc::now().timestamp())
    }

    /// Check issuer, audience, type and expiry, in that order.
    ///
    /// # Errors
    ///
    /// One distinct error per failing dimension: `TokenIssuerMismatch`,
    /// `TokenAudienceMismatch`, `TokenTypeMismatch`, `TokenExpired`.
    pub fn validate_at(&self, token: &Token, now: i64) -> IdentityResult<()> {
        let result = self.check(token, now);
        if let Err(err) = &result {
            debug!(token_id = %token.id(), audience = %token.audience(), reason = err.code(), "Token rejected");
        }
        result
    }

    fn check(&self, token: &Token, now: i64) -> IdentityResult<()> {
        if token.issuer() != self.issuer {
            return Err(IdentityError::TokenIssuerMismatch);
        }
        if !self.audience.is_empty() && token.audience() != self.audience {
            return Err(IdentityError::TokenAudienceMismatch);
        }
        if token.token_type() != self.token_type {
            return Err(IdentityError::TokenTypeMismatch {
                expected: self.token_type,
                actual: token.token_type(),
            });
        }
        if token.is_expired_at(now) {
            return Err(IdentityError::TokenExpired);
        }
        Ok(())
    }
}
