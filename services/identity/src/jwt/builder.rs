//! Fluent construction of claim sets.

use std::collections::BTreeMap;

use super::claims::{Claims, TokenType};
use super::token::Token;
use crate::error::{IdentityError, IdentityResult};

/// Assembles the claims of a new token.
pub struct TokenBuilder {
    issuer: String,
    token_type: TokenType,
    subject: String,
    audience: String,
    scopes: Vec<String>,
    payload: BTreeMap<String, serde_json::Value>,
    ttl_seconds: i64,
    issued_at: Option<i64>,
}

impl TokenBuilder {
    /// Start a token of `token_type` from `issuer`.
    pub fn new(issuer: impl Into<String>, token_type: TokenType) -> Self {
        Self {
            issuer: issuer.into(),
            token_type,
            subject: String::new(),
            audience: String::new(),
            scopes: Vec::new(),
            payload: BTreeMap::new(),
            ttl_seconds: 0,
            issued_at: None,
        }
    }

    /// User the token is about.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// App the token is for.
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    /// Scopes are dropped for types that do not carry them.
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Extra user fields.
    pub fn payload(mut self, payload: BTreeMap<String, serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Lifetime in seconds, must be positive.
    pub fn ttl_seconds(mut self, ttl: i64) -> Self {
        self.ttl_seconds = ttl;
        self
    }

    /// Pin the issue time instead of reading the clock.
    pub fn issued_at(mut self, iat: i64) -> Self {
        self.issued_at = Some(iat);
        self
    }

    /// Build the token with a fresh `jti`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when the lifetime is not positive.
    pub fn build(self) -> IdentityResult<Token> {
        if self.ttl_seconds <= 0 {
            return Err(IdentityError::internal(format!(
                "{} token lifetime must be positive, got {}",
                self.token_type, self.ttl_seconds
            )));
        }

        let iat = self.issued_at.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let scopes = if self.token_type.carries_scopes() {
            self.scopes
        } else {
            Vec::new()
        };

        Ok(Token::from_claims(Claims {
            iss: self.issuer,
            sub: self.subject,
            aud: self.audience,
            exp: iat.saturating_add(self.ttl_seconds),
            iat,
            jti: uuid::Uuid::new_v4().to_string(),
            token_type: self.token_type,
            scopes,
            payload: self.payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_sets_lifetime() {
        let token = TokenBuilder::new("issuer", TokenType::Access)
            .subject("user-1")
            .audience("app-1")
            .scopes(vec!["read".to_string()])
            .ttl_seconds(9000)
            .issued_at(1_000)
            .build()
            .unwrap();

        assert_eq!(token.issued_at(), 1_000);
        assert_eq!(token.expires_at(), 10_000);
        assert_eq!(token.scopes(), ["read".to_string()]);
        assert_eq!(token.token_type(), TokenType::Access);
        assert!(!token.id().is_empty());
    }

    #[test]
    fn test_non_positive_ttl_is_rejected() {
        let result = TokenBuilder::new("issuer", TokenType::Access).ttl_seconds(0).build();
        assert!(matches!(result, Err(IdentityError::Internal(_))));
    }

    #[test]
    fn test_refresh_tokens_drop_scopes() {
        let token = TokenBuilder::new("issuer", TokenType::Refresh)
            .scopes(vec!["read".to_string()])
            .ttl_seconds(60)
            .build()
            .unwrap();
        assert!(token.scopes().is_empty());
    }

    #[test]
    fn test_each_token_gets_unique_id() {
        let a = TokenBuilder::new("issuer", TokenType::Id).ttl_seconds(60).build().unwrap();
        let b = TokenBuilder::new("issuer", TokenType::Id).ttl_seconds(60).build().unwrap();
        assert_ne!(a.id(), b.id());
    }
}
