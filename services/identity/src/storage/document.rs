//! SurrealDB backend.
//!
//! Apps and users are stored as `{ doc: <entity> }` records keyed by the
//! entity id. Refresh records and verification codes are flat records.
//! Redemption claims the old record with one conditional `UPDATE`, so at
//! most one concurrent caller can win it.
//!
//! Users also carry top-level `username` and `email` fields backing the
//! unique indexes. Blank values are stored as NONE and stay unindexed.
//! Statements that lose a transaction conflict are retried, so a caller
//! sees the outcome of the winning write instead of the conflict.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tracing::{debug, info, warn};

use super::password::{hash_password_blocking, verify_password_blocking};
use super::{
    classify_failed_redemption, new_id, unix_now, AppStorage, Page, RefreshRecord, TokenStorage, UserStorage,
    VerificationCodeStorage, MAX_ROTATION_CHAIN,
};
use crate::config::DatabaseSettings;
use crate::error::{IdentityError, IdentityResult};
use crate::model::{normalize_email, App, CodePurpose, User, UserUpdate, VerificationCode};

const SCHEMA: &str = "\
DEFINE INDEX IF NOT EXISTS user_username ON TABLE user COLUMNS username UNIQUE;
DEFINE INDEX IF NOT EXISTS user_email ON TABLE user COLUMNS email UNIQUE;
";

const USERNAME_INDEX: &str = "user_username";
const EMAIL_INDEX: &str = "user_email";

/// Attempts after the first before a conflict is reported as unavailable.
const CONFLICT_RETRIES: u32 = 32;

fn is_conflict(err: &surrealdb::Error) -> bool {
    let message = err.to_string();
    message.contains("read or write conflict") || message.contains("can be retried")
}

/// Run `attempt` again while it fails with a transaction conflict.
async fn retry_conflicts<T, F, Fut>(mut attempt: F) -> Result<T, surrealdb::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, surrealdb::Error>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(err) if retries < CONFLICT_RETRIES && is_conflict(&err) => {
                retries += 1;
                tokio::time::sleep(Duration::from_millis(u64::from(retries))).await;
            }
            result => return result,
        }
    }
}

/// Map a failed user write, turning unique index violations into the
/// matching taken error.
fn user_write_error(operation: &'static str, err: surrealdb::Error) -> IdentityError {
    let message = err.to_string();
    if message.contains(USERNAME_INDEX) {
        IdentityError::UsernameTaken
    } else if message.contains(EMAIL_INDEX) {
        IdentityError::EmailTaken
    } else {
        IdentityError::storage(operation, err)
    }
}

fn non_blank(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[derive(Debug, Deserialize)]
struct DocRow<T> {
    doc: T,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    total: u64,
}

/// Shape of a paged listing over one table.
struct Listing {
    table: &'static str,
    sort_field: &'static str,
    filter_fields: &'static [&'static str],
}

const APP_LISTING: Listing = Listing {
    table: "app",
    sort_field: "name",
    filter_fields: &["name"],
};

const USER_LISTING: Listing = Listing {
    table: "user",
    sort_field: "username",
    filter_fields: &["username", "email"],
};

#[derive(Debug, Deserialize)]
struct CodeRow {
    #[allow(dead_code)]
    code: String,
}

/// Shared SurrealDB handle.
#[derive(Clone)]
pub struct SurrealBackend {
    db: Surreal<Any>,
}

impl SurrealBackend {
    /// Connect, sign in when credentials are configured, and select the
    /// namespace and database named by `settings.name`.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` when the server cannot be reached or rejects
    /// the credentials.
    pub async fn connect(settings: &DatabaseSettings) -> IdentityResult<Self> {
        info!(endpoint = %settings.endpoint, database = %settings.name, "Connecting to SurrealDB");

        let db = any::connect(settings.endpoint.as_str())
            .await
            .map_err(|e| IdentityError::storage("connect", e))?;

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            db.signin(Root { username, password })
                .await
                .map_err(|e| IdentityError::storage("signin", e))?;
        }

        db.use_ns(settings.name.as_str())
            .use_db(settings.name.as_str())
            .await
            .map_err(|e| IdentityError::storage("connect", e))?;

        db.query(SCHEMA)
            .await
            .and_then(|response| response.check())
            .map_err(|e| IdentityError::storage("define_schema", e))?;

        Ok(Self { db })
    }

    /// Listing query: one page of `table` docs plus the total match count.
    async fn fetch_docs<T: DeserializeOwned>(
        &self,
        listing: &Listing,
        filter: &str,
        skip: u64,
        limit: u64,
        operation: &'static str,
    ) -> IdentityResult<Page<T>> {
        let Listing {
            table,
            sort_field,
            filter_fields,
        } = listing;
        let needle = filter.trim().to_lowercase();
        let condition = if needle.is_empty() {
            String::new()
        } else {
            let clauses: Vec<String> = filter_fields
                .iter()
                .map(|field| format!("string::contains(string::lowercase(doc.{field}), $filter)"))
                .collect();
            format!(" WHERE {}", clauses.join(" OR "))
        };
        let window = if limit == 0 { " START $skip" } else { " LIMIT $limit START $skip" };
        let sql = format!(
            "SELECT doc, doc.{sort_field} AS sort_key, doc.id AS sort_id FROM {table}{condition} \
             ORDER BY sort_key, sort_id{window}; \
             SELECT count() AS total FROM {table}{condition} GROUP ALL;"
        );

        let mut response = self
            .db
            .query(sql)
            .bind(("filter", needle))
            .bind(("skip", skip))
            .bind(("limit", limit))
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        let rows: Vec<DocRow<T>> = response.take(0).map_err(|e| IdentityError::storage(operation, e))?;
        let counts: Vec<CountRow> = response.take(1).map_err(|e| IdentityError::storage(operation, e))?;

        Ok(Page {
            items: rows.into_iter().map(|row| row.doc).collect(),
            total: counts.first().map_or(0, |row| row.total),
        })
    }

    async fn doc_by_id<T: DeserializeOwned>(&self, table: &'static str, id: &str, operation: &'static str) -> IdentityResult<Option<T>> {
        let mut response = self
            .db
            .query("SELECT VALUE doc FROM type::thing($table, $id)")
            .bind(("table", table))
            .bind(("id", id.to_string()))
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        let docs: Vec<T> = response.take(0).map_err(|e| IdentityError::storage(operation, e))?;
        Ok(docs.into_iter().next())
    }

    /// Replace the doc of an existing record; false when there is none.
    async fn replace_doc<T>(&self, table: &'static str, id: &str, doc: T, operation: &'static str) -> IdentityResult<bool>
    where
        T: serde::Serialize + DeserializeOwned + Send + 'static,
    {
        let mut response = self
            .db
            .query("UPDATE type::thing($table, $id) SET doc = $doc RETURN AFTER")
            .bind(("table", table))
            .bind(("id", id.to_string()))
            .bind(("doc", doc))
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        let updated: Vec<DocRow<T>> = response.take(0).map_err(|e| IdentityError::storage(operation, e))?;
        Ok(!updated.is_empty())
    }

    /// Create a record; false when one with this id already exists.
    async fn create_doc<T>(&self, table: &'static str, id: &str, doc: T, operation: &'static str) -> IdentityResult<bool>
    where
        T: serde::Serialize + Send + 'static,
    {
        let response = self
            .db
            .query("CREATE type::thing($table, $id) CONTENT { doc: $doc } RETURN NONE")
            .bind(("table", table))
            .bind(("id", id.to_string()))
            .bind(("doc", doc))
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        match response.check() {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().contains("already exists") => Ok(false),
            Err(e) => Err(IdentityError::storage(operation, e)),
        }
    }

    async fn delete_doc(&self, table: &'static str, id: &str, operation: &'static str) -> IdentityResult<bool> {
        let mut response = self
            .db
            .query("SELECT VALUE doc.id FROM type::thing($table, $id); DELETE type::thing($table, $id);")
            .bind(("table", table))
            .bind(("id", id.to_string()))
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        let existing: Vec<String> = response.take(0).map_err(|e| IdentityError::storage(operation, e))?;
        Ok(!existing.is_empty())
    }
}

/// [`AppStorage`] on SurrealDB.
pub struct SurrealAppStorage {
    backend: SurrealBackend,
}

impl SurrealAppStorage {
    /// Storage on a shared connection.
    #[must_use]
    pub const fn new(backend: SurrealBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl AppStorage for SurrealAppStorage {
    async fn app_by_id(&self, id: &str) -> IdentityResult<App> {
        self.backend
            .doc_by_id("app", id, "app_by_id")
            .await?
            .ok_or(IdentityError::AppNotFound)
    }

    async fn add_new_app(&self, mut app: App) -> IdentityResult<App> {
        if app.id.is_empty() {
            app.id = new_id();
        }
        if !self.backend.create_doc("app", &app.id, app.clone(), "add_new_app").await? {
            return Err(IdentityError::AppAlreadyExists);
        }
        Ok(app)
    }

    async fn update_app(&self, id: &str, mut app: App) -> IdentityResult<App> {
        app.id = id.to_string();
        if !self.backend.replace_doc("app", id, app.clone(), "update_app").await? {
            return Err(IdentityError::AppNotFound);
        }
        Ok(app)
    }

    async fn delete_app(&self, id: &str) -> IdentityResult<()> {
        if !self.backend.delete_doc("app", id, "delete_app").await? {
            return Err(IdentityError::AppNotFound);
        }
        Ok(())
    }

    async fn fetch_apps(&self, filter: &str, skip: u64, limit: u64) -> IdentityResult<Page<App>> {
        self.backend
            .fetch_docs(&APP_LISTING, filter, skip, limit, "fetch_apps")
            .await
    }
}

/// [`UserStorage`] on SurrealDB.
pub struct SurrealUserStorage {
    backend: SurrealBackend,
}

impl SurrealUserStorage {
    /// Storage on a shared connection.
    #[must_use]
    pub const fn new(backend: SurrealBackend) -> Self {
        Self { backend }
    }

    async fn user_where(&self, field: &'static str, value: String, operation: &'static str) -> IdentityResult<Option<User>> {
        if value.is_empty() {
            return Ok(None);
        }
        let mut response = self
            .backend
            .db
            .query(format!("SELECT VALUE doc FROM user WHERE doc.{field} = $value LIMIT 1"))
            .bind(("value", value))
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        let users: Vec<User> = response.take(0).map_err(|e| IdentityError::storage(operation, e))?;
        Ok(users.into_iter().next())
    }

    /// Early rejection before hashing. The unique indexes decide races.
    async fn ensure_unique(&self, user: &User, operation: &'static str) -> IdentityResult<()> {
        if let Some(other) = self.user_where("username", user.username.clone(), operation).await? {
            if other.id != user.id {
                return Err(IdentityError::UsernameTaken);
            }
        }
        if let Some(other) = self.user_where("email", user.email.clone(), operation).await? {
            if other.id != user.id {
                return Err(IdentityError::EmailTaken);
            }
        }
        Ok(())
    }

    /// Create the user record; false when the id is taken.
    async fn insert(&self, user: &User) -> Result<bool, surrealdb::Error> {
        let response = self
            .backend
            .db
            .query("CREATE type::thing('user', $id) CONTENT { doc: $doc, username: $username, email: $email } RETURN NONE")
            .bind(("id", user.id.clone()))
            .bind(("doc", user.clone()))
            .bind(("username", non_blank(&user.username)))
            .bind(("email", non_blank(&user.email)))
            .await?;
        match response.check() {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().contains("already exists") => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Replace the stored user; false when there is none.
    async fn replace(&self, user: &User) -> Result<bool, surrealdb::Error> {
        let mut response = self
            .backend
            .db
            .query("UPDATE type::thing('user', $id) SET doc = $doc, username = $username, email = $email RETURN AFTER")
            .bind(("id", user.id.clone()))
            .bind(("doc", user.clone()))
            .bind(("username", non_blank(&user.username)))
            .bind(("email", non_blank(&user.email)))
            .await?;
        let updated: Vec<DocRow<User>> = response.take(0)?;
        Ok(!updated.is_empty())
    }
}

#[async_trait]
impl UserStorage for SurrealUserStorage {
    async fn user_by_id(&self, id: &str) -> IdentityResult<User> {
        self.backend
            .doc_by_id("user", id, "user_by_id")
            .await?
            .ok_or(IdentityError::UserNotFound)
    }

    async fn user_by_email(&self, email: &str) -> IdentityResult<User> {
        self.user_where("email", normalize_email(email), "user_by_email")
            .await?
            .ok_or(IdentityError::UserNotFound)
    }

    async fn user_by_name_password(&self, username: &str, password: &str) -> IdentityResult<User> {
        let user = self
            .user_where("username", username.to_string(), "user_by_name_password")
            .await?
            .ok_or(IdentityError::InvalidCredentials)?;
        if verify_password_blocking(password.to_string(), user.password_hash.clone()).await {
            Ok(user)
        } else {
            Err(IdentityError::InvalidCredentials)
        }
    }

    async fn user_exists(&self, username: &str) -> IdentityResult<bool> {
        Ok(self
            .user_where("username", username.to_string(), "user_exists")
            .await?
            .is_some())
    }

    async fn add_new_user(&self, mut user: User, password: &str) -> IdentityResult<User> {
        if user.id.is_empty() {
            user.id = new_id();
        }
        user.email = normalize_email(&user.email);
        self.ensure_unique(&user, "add_new_user").await?;
        user.password_hash = hash_password_blocking(password.to_string()).await?;

        let created = retry_conflicts(|| self.insert(&user))
            .await
            .map_err(|e| user_write_error("add_new_user", e))?;
        if !created {
            return Err(IdentityError::internal(format!("duplicate user id {}", user.id)));
        }
        Ok(user)
    }

    async fn reset_password(&self, id: &str, password: &str) -> IdentityResult<()> {
        let hash = hash_password_blocking(password.to_string()).await?;
        let mut response = self
            .backend
            .db
            .query("UPDATE type::thing('user', $id) SET doc.password_hash = $hash RETURN AFTER")
            .bind(("id", id.to_string()))
            .bind(("hash", hash))
            .await
            .map_err(|e| IdentityError::storage("reset_password", e))?;
        let updated: Vec<DocRow<User>> = response
            .take(0)
            .map_err(|e| IdentityError::storage("reset_password", e))?;
        if updated.is_empty() {
            return Err(IdentityError::UserNotFound);
        }
        Ok(())
    }

    async fn update_user(&self, id: &str, update: UserUpdate) -> IdentityResult<User> {
        let mut user = self.user_by_id(id).await?;
        update.apply(&mut user);
        self.ensure_unique(&user, "update_user").await?;
        let replaced = retry_conflicts(|| self.replace(&user))
            .await
            .map_err(|e| user_write_error("update_user", e))?;
        if !replaced {
            return Err(IdentityError::UserNotFound);
        }
        Ok(user)
    }

    async fn delete_user(&self, id: &str) -> IdentityResult<()> {
        if !self.backend.delete_doc("user", id, "delete_user").await? {
            return Err(IdentityError::UserNotFound);
        }
        Ok(())
    }

    async fn fetch_users(&self, filter: &str, skip: u64, limit: u64) -> IdentityResult<Page<User>> {
        self.backend
            .fetch_docs(&USER_LISTING, filter, skip, limit, "fetch_users")
            .await
    }
}

/// [`TokenStorage`] on SurrealDB.
pub struct SurrealTokenStorage {
    backend: SurrealBackend,
}

impl SurrealTokenStorage {
    /// Storage on a shared connection.
    #[must_use]
    pub const fn new(backend: SurrealBackend) -> Self {
        Self { backend }
    }

    async fn record(&self, token_id: &str, operation: &'static str) -> IdentityResult<Option<RefreshRecord>> {
        let mut response = self
            .backend
            .db
            .query("SELECT state, successor, expires_at FROM type::thing('refresh_token', $id)")
            .bind(("id", token_id.to_string()))
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        let records: Vec<RefreshRecord> = response.take(0).map_err(|e| IdentityError::storage(operation, e))?;
        Ok(records.into_iter().next())
    }

    async fn revoke(&self, token_id: &str) -> Result<Option<String>, surrealdb::Error> {
        let mut response = self
            .backend
            .db
            .query("UPDATE type::thing('refresh_token', $id) SET state = 'revoked' RETURN AFTER")
            .bind(("id", token_id.to_string()))
            .await?;
        let revoked: Vec<RefreshRecord> = response.take(0)?;
        Ok(revoked.into_iter().next().and_then(|record| record.successor))
    }

    /// Revoke one record, returning its successor.
    async fn revoke_one(&self, token_id: &str, operation: &'static str) -> IdentityResult<Option<String>> {
        retry_conflicts(|| self.revoke(token_id))
            .await
            .map_err(|e| IdentityError::storage(operation, e))
    }

    /// Mark a live record rotated; false when it was not live.
    async fn claim(&self, token_id: &str, successor_id: &str, now: i64) -> Result<bool, surrealdb::Error> {
        let mut response = self
            .backend
            .db
            .query(
                "UPDATE type::thing('refresh_token', $id) SET state = 'rotated', successor = $successor \
                 WHERE state = 'valid' AND expires_at > $now RETURN BEFORE",
            )
            .bind(("id", token_id.to_string()))
            .bind(("successor", successor_id.to_string()))
            .bind(("now", now))
            .await?;
        let claimed: Vec<RefreshRecord> = response.take(0)?;
        Ok(!claimed.is_empty())
    }

    /// Drop a successor record that was never handed out.
    async fn discard(&self, token_id: &str) {
        let result = self
            .backend
            .db
            .query("DELETE type::thing('refresh_token', $id)")
            .bind(("id", token_id.to_string()))
            .await
            .and_then(|response| response.check());
        if let Err(err) = result {
            debug!(token_id = %token_id, error = %err, "Unused successor left for purge");
        }
    }
}

#[async_trait]
impl TokenStorage for SurrealTokenStorage {
    async fn put(&self, token_id: &str, expires_at: i64) -> IdentityResult<()> {
        let db = &self.backend.db;
        retry_conflicts(move || async move {
            db.query("UPSERT type::thing('refresh_token', $id) CONTENT $record RETURN NONE")
                .bind(("id", token_id.to_string()))
                .bind(("record", RefreshRecord::valid(expires_at)))
                .await
                .and_then(|response| response.check())
        })
        .await
        .map_err(|e| IdentityError::storage("put_token", e))?;
        Ok(())
    }

    async fn is_valid(&self, token_id: &str) -> IdentityResult<bool> {
        let now = unix_now();
        Ok(self
            .record(token_id, "is_valid")
            .await?
            .is_some_and(|record| record.is_live_at(now)))
    }

    async fn invalidate(&self, token_id: &str) -> IdentityResult<()> {
        self.revoke_one(token_id, "invalidate").await.map(|_| ())
    }

    async fn redeem(&self, token_id: &str, successor_id: &str, successor_expires_at: i64) -> IdentityResult<()> {
        let now = unix_now();
        // The successor exists before the claim commits, so a caller that
        // loses the claim always finds it to revoke.
        self.put(successor_id, successor_expires_at).await?;

        match retry_conflicts(|| self.claim(token_id, successor_id, now)).await {
            Ok(true) => return Ok(()),
            Ok(false) => self.discard(successor_id).await,
            Err(err) => {
                warn!(token_id = %token_id, error = %err, "Refresh claim failed");
                self.discard(successor_id).await;
                return Err(IdentityError::storage("redeem", err));
            }
        }

        let record = self.record(token_id, "redeem").await?;
        let mut next = Some(classify_failed_redemption(record.as_ref(), now)?);
        for _ in 0..MAX_ROTATION_CHAIN {
            let Some(id) = next.take() else { break };
            next = self.revoke_one(&id, "redeem").await?;
        }
        Err(IdentityError::TokenReused)
    }

    async fn purge_expired(&self, now: i64) -> IdentityResult<u64> {
        let mut response = self
            .backend
            .db
            .query(
                "SELECT count() AS total FROM refresh_token WHERE expires_at <= $now GROUP ALL; \
                 DELETE refresh_token WHERE expires_at <= $now;",
            )
            .bind(("now", now))
            .await
            .map_err(|e| IdentityError::storage("purge_expired", e))?;
        let counts: Vec<CountRow> = response
            .take(0)
            .map_err(|e| IdentityError::storage("purge_expired", e))?;
        let purged = counts.first().map_or(0, |row| row.total);
        debug!(purged, "Purged expired refresh records");
        Ok(purged)
    }
}

/// [`VerificationCodeStorage`] on SurrealDB.
pub struct SurrealVerificationCodeStorage {
    backend: SurrealBackend,
}

impl SurrealVerificationCodeStorage {
    /// Storage on a shared connection.
    #[must_use]
    pub const fn new(backend: SurrealBackend) -> Self {
        Self { backend }
    }

    /// Delete a matching live code, clearing an expired one; true when a
    /// code was consumed.
    async fn consume(&self, key: &str, code: &str, now: i64) -> Result<bool, surrealdb::Error> {
        let mut response = self
            .backend
            .db
            .query(
                "DELETE type::thing('verification_code', $key) WHERE code = $code AND expires_at > $now RETURN BEFORE; \
                 DELETE type::thing('verification_code', $key) WHERE expires_at <= $now;",
            )
            .bind(("key", key.to_string()))
            .bind(("code", code.to_string()))
            .bind(("now", now))
            .await?;
        let consumed: Vec<CodeRow> = response.take(0)?;
        Ok(!consumed.is_empty())
    }
}

fn code_key(user_id: &str, purpose: CodePurpose) -> String {
    format!("{user_id}:{}", purpose.as_str())
}

#[async_trait]
impl VerificationCodeStorage for SurrealVerificationCodeStorage {
    async fn create_code(&self, code: VerificationCode) -> IdentityResult<()> {
        let key = code_key(&code.user_id, code.purpose);
        self.backend
            .db
            .query("UPSERT type::thing('verification_code', $key) CONTENT $code RETURN NONE")
            .bind(("key", key))
            .bind(("code", code))
            .await
            .and_then(|response| response.check())
            .map_err(|e| IdentityError::storage("create_code", e))?;
        Ok(())
    }

    async fn consume_code(&self, user_id: &str, purpose: CodePurpose, code: &str) -> IdentityResult<()> {
        let key = code_key(user_id, purpose);
        let now = unix_now();
        let consumed = retry_conflicts(|| self.consume(&key, code, now))
            .await
            .map_err(|e| IdentityError::storage("consume_code", e))?;
        if consumed {
            Ok(())
        } else {
            Err(IdentityError::VerificationCodeInvalid)
        }
    }
}
