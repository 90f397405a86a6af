//! One-time verification codes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// What a verification code unlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodePurpose {
    /// Resets a forgotten password
    PasswordReset,
    /// Confirms a new account
    RegistrationConfirmation,
}

impl CodePurpose {
    /// Name used in storage keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PasswordReset => "password_reset",
            Self::RegistrationConfirmation => "registration_confirmation",
        }
    }
}

/// One-time code sent to a user out of band.
///
/// At most one code per user and purpose is outstanding; it can be
/// consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCode {
    /// Owner
    pub user_id: String,
    /// What it unlocks
    pub purpose: CodePurpose,
    /// Six decimal digits
    pub code: String,
    /// Unix seconds
    pub expires_at: i64,
}

impl VerificationCode {
    /// Random six digit code valid for `ttl_seconds`.
    #[must_use]
    pub fn generate(user_id: impl Into<String>, purpose: CodePurpose, ttl_seconds: i64) -> Self {
        let code = rand::thread_rng().gen_range(0..1_000_000u32);
        Self {
            user_id: user_id.into(),
            purpose,
            code: format!("{code:06}"),
            expires_at: chrono::Utc::now().timestamp().saturating_add(ttl_seconds),
        }
    }

    /// Constant-time comparison with `candidate`.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        bool::from(self.code.as_bytes().ct_eq(candidate.as_bytes()))
    }

    /// Expired once `now` reaches `expires_at`.
    #[must_use]
    pub const fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}
