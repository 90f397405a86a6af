//! Verified tokens.

use std::collections::BTreeMap;

use super::claims::{Claims, TokenType};

/// An issued or parsed token.
///
/// Two tokens are equal when their claims are equal, which is exactly when
/// their signed payloads are equal.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    claims: Claims,
}

impl Token {
    pub(crate) const fn from_claims(claims: Claims) -> Self {
        Self { claims }
    }

    /// Signed claims.
    #[must_use]
    pub const fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Unwrap into the signed claims.
    #[must_use]
    pub fn into_claims(self) -> Claims {
        self.claims
    }

    /// Token id (`jti`).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.claims.jti
    }

    /// User id, empty for app-only tokens.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    /// Issuer (`iss`).
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.claims.iss
    }

    /// App id the token was minted for.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.claims.aud
    }

    /// Granted scopes, empty for types that carry none.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.claims.scopes
    }

    /// Value of the `type` claim.
    #[must_use]
    pub const fn token_type(&self) -> TokenType {
        self.claims.token_type
    }

    /// Unix seconds
    #[must_use]
    pub const fn issued_at(&self) -> i64 {
        self.claims.iat
    }

    /// Unix seconds
    #[must_use]
    pub const fn expires_at(&self) -> i64 {
        self.claims.exp
    }

    /// User fields copied in at issue time.
    #[must_use]
    pub const fn payload(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.claims.payload
    }

    /// Expired once `now` reaches `exp`.
    #[must_use]
    pub const fn is_expired_at(&self, now: i64) -> bool {
        now >= self.claims.exp
    }

    /// Expired at the current time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }
}
