//! In-process backend.
//!
//! Plain maps behind `parking_lot` locks. Every compound operation runs
//! under a single lock acquisition, which is what makes redemption and code
//! consumption atomic here. Nothing survives a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::password::{hash_password_blocking, verify_password_blocking};
use super::{
    classify_failed_redemption, matches_filter, new_id, paginate, unix_now, AppStorage, Page, RefreshRecord,
    RefreshState, TokenStorage, UserStorage, VerificationCodeStorage, MAX_ROTATION_CHAIN,
};
use crate::error::{IdentityError, IdentityResult};
use crate::model::{normalize_email, App, CodePurpose, User, UserUpdate, VerificationCode};

/// In-memory [`AppStorage`].
#[derive(Debug, Default)]
pub struct MemoryAppStorage {
    apps: RwLock<HashMap<String, App>>,
}

impl MemoryAppStorage {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppStorage for MemoryAppStorage {
    async fn app_by_id(&self, id: &str) -> IdentityResult<App> {
        self.apps.read().get(id).cloned().ok_or(IdentityError::AppNotFound)
    }

    async fn add_new_app(&self, mut app: App) -> IdentityResult<App> {
        if app.id.is_empty() {
            app.id = new_id();
        }
        let mut apps = self.apps.write();
        if apps.contains_key(&app.id) {
            return Err(IdentityError::AppAlreadyExists);
        }
        apps.insert(app.id.clone(), app.clone());
        Ok(app)
    }

    async fn update_app(&self, id: &str, mut app: App) -> IdentityResult<App> {
        let mut apps = self.apps.write();
        let stored = apps.get_mut(id).ok_or(IdentityError::AppNotFound)?;
        app.id = id.to_string();
        *stored = app.clone();
        Ok(app)
    }

    async fn delete_app(&self, id: &str) -> IdentityResult<()> {
        self.apps.write().remove(id).map(|_| ()).ok_or(IdentityError::AppNotFound)
    }

    async fn fetch_apps(&self, filter: &str, skip: u64, limit: u64) -> IdentityResult<Page<App>> {
        let mut apps: Vec<App> = self
            .apps
            .read()
            .values()
            .filter(|app| matches_filter(&[&app.name], filter))
            .cloned()
            .collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(paginate(apps, skip, limit))
    }
}

/// In-memory [`UserStorage`].
#[derive(Debug, Default)]
pub struct MemoryUserStorage {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserStorage {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Uniqueness of non-empty usernames and emails among users other than
/// `user.id`.
fn ensure_unique(users: &HashMap<String, User>, user: &User) -> IdentityResult<()> {
    for other in users.values().filter(|other| other.id != user.id) {
        if !user.username.is_empty() && other.username == user.username {
            return Err(IdentityError::UsernameTaken);
        }
        if !user.email.is_empty() && other.email == user.email {
            return Err(IdentityError::EmailTaken);
        }
    }
    Ok(())
}

#[async_trait]
impl UserStorage for MemoryUserStorage {
    async fn user_by_id(&self, id: &str) -> IdentityResult<User> {
        self.users.read().get(id).cloned().ok_or(IdentityError::UserNotFound)
    }

    async fn user_by_email(&self, email: &str) -> IdentityResult<User> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(IdentityError::UserNotFound);
        }
        self.users
            .read()
            .values()
            .find(|user| user.email == email)
            .cloned()
            .ok_or(IdentityError::UserNotFound)
    }

    async fn user_by_name_password(&self, username: &str, password: &str) -> IdentityResult<User> {
        let user = self
            .users
            .read()
            .values()
            .find(|user| !username.is_empty() && user.username == username)
            .cloned()
            .ok_or(IdentityError::InvalidCredentials)?;

        if verify_password_blocking(password.to_string(), user.password_hash.clone()).await {
            Ok(user)
        } else {
            Err(IdentityError::InvalidCredentials)
        }
    }

    async fn user_exists(&self, username: &str) -> IdentityResult<bool> {
        Ok(!username.is_empty() && self.users.read().values().any(|user| user.username == username))
    }

    async fn add_new_user(&self, mut user: User, password: &str) -> IdentityResult<User> {
        if user.id.is_empty() {
            user.id = new_id();
        }
        user.email = normalize_email(&user.email);
        user.password_hash = hash_password_blocking(password.to_string()).await?;

        let mut users = self.users.write();
        if users.contains_key(&user.id) {
            return Err(IdentityError::internal(format!("duplicate user id {}", user.id)));
        }
        ensure_unique(&users, &user)?;
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn reset_password(&self, id: &str, password: &str) -> IdentityResult<()> {
        if !self.users.read().contains_key(id) {
            return Err(IdentityError::UserNotFound);
        }
        let hash = hash_password_blocking(password.to_string()).await?;
        let mut users = self.users.write();
        let user = users.get_mut(id).ok_or(IdentityError::UserNotFound)?;
        user.password_hash = hash;
        Ok(())
    }

    async fn update_user(&self, id: &str, update: UserUpdate) -> IdentityResult<User> {
        let mut users = self.users.write();
        let mut user = users.get(id).cloned().ok_or(IdentityError::UserNotFound)?;
        update.apply(&mut user);
        ensure_unique(&users, &user)?;
        users.insert(id.to_string(), user.clone());
        Ok(user)
    }

    async fn delete_user(&self, id: &str) -> IdentityResult<()> {
        self.users.write().remove(id).map(|_| ()).ok_or(IdentityError::UserNotFound)
    }

    async fn fetch_users(&self, filter: &str, skip: u64, limit: u64) -> IdentityResult<Page<User>> {
        let mut users: Vec<User> = self
            .users
            .read()
            .values()
            .filter(|user| matches_filter(&[&user.username, &user.email], filter))
            .cloned()
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.id.cmp(&b.id)));
        Ok(paginate(users, skip, limit))
    }
}

/// In-memory [`TokenStorage`].
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    records: Mutex<HashMap<String, RefreshRecord>>,
}

impl MemoryTokenStorage {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn revoke_chain(records: &mut HashMap<String, RefreshRecord>, start: String) {
    let mut next = Some(start);
    for _ in 0..MAX_ROTATION_CHAIN {
        let Some(id) = next.take() else { break };
        let Some(record) = records.get_mut(&id) else { break };
        next = record.successor.clone();
        record.state = RefreshState::Revoked;
    }
}

#[async_trait]
impl TokenStorage for MemoryTokenStorage {
    async fn put(&self, token_id: &str, expires_at: i64) -> IdentityResult<()> {
        self.records
            .lock()
            .insert(token_id.to_string(), RefreshRecord::valid(expires_at));
        Ok(())
    }

    async fn is_valid(&self, token_id: &str) -> IdentityResult<bool> {
        let now = unix_now();
        Ok(self.records.lock().get(token_id).is_some_and(|record| record.is_live_at(now)))
    }

    async fn invalidate(&self, token_id: &str) -> IdentityResult<()> {
        if let Some(record) = self.records.lock().get_mut(token_id) {
            record.state = RefreshState::Revoked;
        }
        Ok(())
    }

    async fn redeem(&self, token_id: &str, successor_id: &str, successor_expires_at: i64) -> IdentityResult<()> {
        let now = unix_now();
        let mut records = self.records.lock();

        if let Some(record) = records.get_mut(token_id).filter(|record| record.is_live_at(now)) {
            record.state = RefreshState::Rotated;
            record.successor = Some(successor_id.to_string());
            records.insert(successor_id.to_string(), RefreshRecord::valid(successor_expires_at));
            return Ok(());
        }

        let successor = classify_failed_redemption(records.get(token_id), now)?;
        revoke_chain(&mut records, successor);
        Err(IdentityError::TokenReused)
    }

    async fn purge_expired(&self, now: i64) -> IdentityResult<u64> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        let purged = (before - records.len()) as u64;
        debug!(purged, "Purged expired refresh records");
        Ok(purged)
    }
}

/// In-memory [`VerificationCodeStorage`].
#[derive(Debug, Default)]
pub struct MemoryVerificationCodeStorage {
    codes: Mutex<HashMap<(String, CodePurpose), VerificationCode>>,
}

impl MemoryVerificationCodeStorage {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerificationCodeStorage for MemoryVerificationCodeStorage {
    async fn create_code(&self, code: VerificationCode) -> IdentityResult<()> {
        self.codes
            .lock()
            .insert((code.user_id.clone(), code.purpose), code);
        Ok(())
    }

    async fn consume_code(&self, user_id: &str, purpose: CodePurpose, code: &str) -> IdentityResult<()> {
        let key = (user_id.to_string(), purpose);
        let mut codes = self.codes.lock();
        let stored = codes.get(&key).ok_or(IdentityError::VerificationCodeInvalid)?;

        if stored.is_expired_at(unix_now()) {
            codes.remove(&key);
            return Err(IdentityError::VerificationCodeInvalid);
        }
        if !stored.matches(code) {
            return Err(IdentityError::VerificationCodeInvalid);
        }
        codes.remove(&key);
        Ok(())
    }
}
