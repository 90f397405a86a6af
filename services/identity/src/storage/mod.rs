//! Storage capability contracts and their backends.
//!
//! Every backend implements the same four traits with the same observable
//! behavior, error kinds included, so the composer can substitute one for
//! another per category.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, IdentityResult};
use crate::model::{App, CodePurpose, User, UserUpdate, VerificationCode};

pub mod document;
pub mod keyvalue;
pub mod memory;
pub mod password;

/// The independently composable storage categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageCategory {
    /// Registered apps
    App,
    /// User accounts
    User,
    /// Refresh records
    Token,
    /// One-time codes
    VerificationCode,
}

impl StorageCategory {
    /// Every category, in composition order.
    pub const ALL: [Self; 4] = [Self::App, Self::User, Self::Token, Self::VerificationCode];
}

impl fmt::Display for StorageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::App => "app storage",
            Self::User => "user storage",
            Self::Token => "token storage",
            Self::VerificationCode => "verification code storage",
        })
    }
}

/// One page of a listing plus the number of matches overall.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items of this page
    pub items: Vec<T>,
    /// Matches across all pages
    pub total: u64,
}

/// Registered apps.
#[async_trait]
pub trait AppStorage: Send + Sync {
    /// # Errors
    ///
    /// `AppNotFound` when no app has this id.
    async fn app_by_id(&self, id: &str) -> IdentityResult<App>;

    /// Like [`AppStorage::app_by_id`] but fails with `AppInactive` for a
    /// disabled app.
    async fn active_app_by_id(&self, id: &str) -> IdentityResult<App> {
        let app = self.app_by_id(id).await?;
        if !app.active {
            return Err(IdentityError::AppInactive);
        }
        Ok(app)
    }

    /// Store a new app, assigning an id when it has none.
    async fn add_new_app(&self, app: App) -> IdentityResult<App>;

    /// Replace every field but the id.
    async fn update_app(&self, id: &str, app: App) -> IdentityResult<App>;

    /// # Errors
    ///
    /// `AppNotFound` when no app has this id.
    async fn delete_app(&self, id: &str) -> IdentityResult<()>;

    /// Apps whose name contains `filter` case-insensitively, ordered by
    /// name then id. A `limit` of zero returns everything after `skip`.
    async fn fetch_apps(&self, filter: &str, skip: u64, limit: u64) -> IdentityResult<Page<App>>;
}

/// User accounts and their credentials.
#[async_trait]
pub trait UserStorage: Send + Sync {
    /// # Errors
    ///
    /// `UserNotFound` when no user has this id.
    async fn user_by_id(&self, id: &str) -> IdentityResult<User>;

    /// Lookup by normalized email.
    async fn user_by_email(&self, email: &str) -> IdentityResult<User>;

    /// Fails with `InvalidCredentials` both for unknown users and for wrong
    /// passwords.
    async fn user_by_name_password(&self, username: &str, password: &str) -> IdentityResult<User>;

    /// True when a user holds `username`.
    async fn user_exists(&self, username: &str) -> IdentityResult<bool>;

    /// Store a new user with `password` hashed. Any hash already on `user`
    /// is discarded.
    async fn add_new_user(&self, user: User, password: &str) -> IdentityResult<User>;

    /// Replace the password hash.
    async fn reset_password(&self, id: &str, password: &str) -> IdentityResult<()>;

    /// Apply `update`, keeping usernames and emails unique.
    async fn update_user(&self, id: &str, update: UserUpdate) -> IdentityResult<User>;

    /// # Errors
    ///
    /// `UserNotFound` when no user has this id.
    async fn delete_user(&self, id: &str) -> IdentityResult<()>;

    /// Users whose username or email contains `filter`, ordered by username
    /// then id.
    async fn fetch_users(&self, filter: &str, skip: u64, limit: u64) -> IdentityResult<Page<User>>;

    /// Narrow `requested` to what the user may be granted. An empty request
    /// yields the full permitted set.
    async fn request_scopes(&self, user_id: &str, requested: &[String]) -> IdentityResult<Vec<String>> {
        let user = self.user_by_id(user_id).await?;
        grant_scopes(&user.scopes, requested)
    }
}

/// Liveness authority for refresh tokens.
#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// Record a freshly minted refresh token as valid.
    async fn put(&self, token_id: &str, expires_at: i64) -> IdentityResult<()>;

    /// Valid, not yet redeemed or revoked, and not expired.
    async fn is_valid(&self, token_id: &str) -> IdentityResult<bool>;

    /// Revoke a token. Unknown ids are ignored.
    async fn invalidate(&self, token_id: &str) -> IdentityResult<()>;

    /// Atomically check that `token_id` is valid, mark it redeemed and
    /// record `successor_id` as valid.
    ///
    /// Redeeming an already redeemed token revokes its live successor and
    /// fails with `TokenReused`. Unknown or revoked tokens fail with
    /// `TokenRevoked`, expired ones with `TokenExpired`.
    async fn redeem(&self, token_id: &str, successor_id: &str, successor_expires_at: i64) -> IdentityResult<()>;

    /// Drop records that expired before `now`; returns how many.
    async fn purge_expired(&self, now: i64) -> IdentityResult<u64>;
}

/// One-time codes, at most one per user and purpose.
#[async_trait]
pub trait VerificationCodeStorage: Send + Sync {
    /// Store `code`, replacing any outstanding code for the same user and
    /// purpose.
    async fn create_code(&self, code: VerificationCode) -> IdentityResult<()>;

    /// Use a code up. Wrong, expired and already consumed codes all fail
    /// with `VerificationCodeInvalid`.
    async fn consume_code(&self, user_id: &str, purpose: CodePurpose, code: &str) -> IdentityResult<()>;
}

/// State of a refresh token record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    /// Redeemable
    Valid,
    /// Redeemed once; `successor` names the replacement
    Rotated,
    /// Logged out or revoked after a replay
    Revoked,
}

impl RefreshState {
    /// Stored form of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Rotated => "rotated",
            Self::Revoked => "revoked",
        }
    }
}

/// Stored state of one refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRecord {
    /// Rotation state
    pub state: RefreshState,
    /// Set once rotated
    #[serde(default)]
    pub successor: Option<String>,
    /// Unix seconds
    pub expires_at: i64,
}

impl RefreshRecord {
    /// A fresh, redeemable record.
    #[must_use]
    pub const fn valid(expires_at: i64) -> Self {
        Self {
            state: RefreshState::Valid,
            successor: None,
            expires_at,
        }
    }

    /// Valid and not yet expired at `now`.
    #[must_use]
    pub fn is_live_at(&self, now: i64) -> bool {
        self.state == RefreshState::Valid && now < self.expires_at
    }
}

/// Why a redemption did not claim the record, given the record as found.
///
/// `Ok(successor)` means the token was redeemed before and its successor
/// chain starting at `successor` has to be revoked.
pub(crate) fn classify_failed_redemption(record: Option<&RefreshRecord>, now: i64) -> Result<String, IdentityError> {
    match record {
        None => Err(IdentityError::TokenRevoked),
        Some(record) => match record.state {
            RefreshState::Valid if now >= record.expires_at => Err(IdentityError::TokenExpired),
            RefreshState::Rotated => record.successor.clone().ok_or(IdentityError::TokenReused),
            RefreshState::Valid | RefreshState::Revoked => Err(IdentityError::TokenRevoked),
        },
    }
}

/// Longest successor chain followed when revoking after a replay.
pub(crate) const MAX_ROTATION_CHAIN: usize = 1024;

/// Scopes of `requested` the holder of `permitted` may be granted.
///
/// # Errors
///
/// `ScopeNotAllowed` when scopes were requested and none are permitted.
pub fn grant_scopes(permitted: &[String], requested: &[String]) -> IdentityResult<Vec<String>> {
    if requested.is_empty() {
        return Ok(permitted.to_vec());
    }
    let granted = intersect_scopes(requested, permitted);
    if granted.is_empty() {
        return Err(IdentityError::ScopeNotAllowed);
    }
    Ok(granted)
}

/// Members of `scopes` also in `allowed`, in `scopes` order, without
/// duplicates.
#[must_use]
pub fn intersect_scopes(scopes: &[String], allowed: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(scopes.len());
    for scope in scopes {
        if allowed.contains(scope) && !out.contains(scope) {
            out.push(scope.clone());
        }
    }
    out
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn matches_filter(fields: &[&str], filter: &str) -> bool {
    let needle = filter.trim().to_lowercase();
    needle.is_empty() || fields.iter().any(|field| field.to_lowercase().contains(&needle))
}

/// Slice an already ordered listing.
pub(crate) fn paginate<T>(items: Vec<T>, skip: u64, limit: u64) -> Page<T> {
    let total = items.len() as u64;
    let skip = usize::try_from(skip).unwrap_or(usize::MAX);
    let iter = items.into_iter().skip(skip);
    let items = if limit == 0 {
        iter.collect()
    } else {
        iter.take(usize::try_from(limit).unwrap_or(usize::MAX)).collect()
    };
    Page { items, total }
}
