//! Redis backend.
//!
//! Entities are JSON strings under `{name}:{kind}:{id}` with id sets for
//! listing. Username and email index keys point at the owning user id; a
//! user write, its index claims and its set membership run as one Lua
//! script, so a failed write never leaves an index behind. Refresh records and verification codes are hashes expiring with
//! the token or code they track; their compound operations run as Lua
//! scripts, so they are atomic on the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::password::{hash_password_blocking, verify_password_blocking};
use super::{
    matches_filter, new_id, paginate, unix_now, AppStorage, Page, TokenStorage, UserStorage,
    VerificationCodeStorage, MAX_ROTATION_CHAIN,
};
use crate::config::DatabaseSettings;
use crate::error::{IdentityError, IdentityResult};
use crate::model::{normalize_email, App, CodePurpose, User, UserUpdate, VerificationCode};

const REDEEM_SCRIPT: &str = r"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then return {'missing'} end
if state == 'valid' then
  if tonumber(redis.call('HGET', KEYS[1], 'expires_at')) <= tonumber(ARGV[1]) then
    return {'expired'}
  end
  redis.call('HSET', KEYS[1], 'state', 'rotated', 'successor', ARGV[2])
  redis.call('HSET', KEYS[2], 'state', 'valid', 'expires_at', ARGV[3])
  redis.call('EXPIREAT', KEYS[2], ARGV[3])
  return {'redeemed'}
end
if state == 'rotated' then
  return {'rotated', redis.call('HGET', KEYS[1], 'successor') or ''}
end
return {'revoked'}
";

// KEYS: user, user id set. ARGV: id, json, mode, username, email,
// username index prefix, email index prefix. Blank values are unindexed.
const SAVE_USER_SCRIPT: &str = r"
local stored = redis.call('GET', KEYS[1])
if ARGV[3] == 'create' and stored then return 'duplicate' end
if ARGV[3] == 'update' and not stored then return 'missing' end
local previous = {}
if stored then previous = cjson.decode(stored) end
local indexes = {
  {ARGV[6], ARGV[4], previous.username, 'username_taken'},
  {ARGV[7], ARGV[5], previous.email, 'email_taken'},
}
for _, index in ipairs(indexes) do
  if index[2] ~= '' then
    local holder = redis.call('GET', index[1] .. index[2])
    if holder and holder ~= ARGV[1] then return index[4] end
  end
end
for _, index in ipairs(indexes) do
  local old = index[3]
  if type(old) == 'string' and old ~= '' and old ~= index[2] and redis.call('GET', index[1] .. old) == ARGV[1] then
    redis.call('DEL', index[1] .. old)
  end
  if index[2] ~= '' then redis.call('SET', index[1] .. index[2], ARGV[1]) end
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SADD', KEYS[2], ARGV[1])
return 'stored'
";

const REVOKE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return false end
redis.call('HSET', KEYS[1], 'state', 'revoked')
return redis.call('HGET', KEYS[1], 'successor')
";

const CONSUME_CODE_SCRIPT: &str = r"
local code = redis.call('HGET', KEYS[1], 'code')
if not code then return 0 end
if tonumber(redis.call('HGET', KEYS[1], 'expires_at')) <= tonumber(ARGV[2]) then
  redis.call('DEL', KEYS[1])
  return 0
end
if code ~= ARGV[1] then return 0 end
redis.call('DEL', KEYS[1])
return 1
";

/// Shared connection plus key namespace.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    /// Connect and verify the server answers.
    ///
    /// # Errors
    ///
    /// `Configuration` for an invalid URL, `StorageUnavailable` when the
    /// server cannot be reached.
    pub async fn connect(settings: &DatabaseSettings) -> IdentityResult<Self> {
        info!(endpoint = %settings.endpoint, prefix = %settings.name, "Connecting to Redis");

        let client = redis::Client::open(settings.endpoint.as_str())
            .map_err(|e| IdentityError::config(format!("Invalid Redis endpoint: {e}")))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| IdentityError::storage("connect", e))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| IdentityError::storage("connect", e))?;

        Ok(Self {
            conn,
            prefix: settings.name.clone(),
        })
    }

    fn key(&self, kind: &str, id: &str) -> String {
        format!("{}:{kind}:{id}", self.prefix)
    }

    fn set_key(&self, kind: &str) -> String {
        format!("{}:{kind}", self.prefix)
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str, operation: &'static str) -> IdentityResult<Option<T>> {
        let value: Option<String> = self
            .conn()
            .get(key)
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        value
            .map(|raw| serde_json::from_str(&raw).map_err(|e| IdentityError::storage(operation, e)))
            .transpose()
    }

    /// `SET` with an optional `NX`/`XX` condition; false when the condition
    /// failed.
    async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        condition: Option<&str>,
        operation: &'static str,
    ) -> IdentityResult<bool> {
        let raw = serde_json::to_string(value).map_err(|e| IdentityError::internal(e.to_string()))?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(raw);
        if let Some(condition) = condition {
            cmd.arg(condition);
        }
        let reply: Option<String> = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        Ok(reply.is_some())
    }

    async fn load_all<T: DeserializeOwned>(&self, kind: &str, operation: &'static str) -> IdentityResult<Vec<T>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers(self.set_key(&format!("{kind}s")))
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.key(kind, id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;

        values
            .into_iter()
            .flatten()
            .map(|raw| serde_json::from_str(&raw).map_err(|e| IdentityError::storage(operation, e)))
            .collect()
    }
}

/// [`AppStorage`] on Redis.
pub struct RedisAppStorage {
    backend: RedisBackend,
}

impl RedisAppStorage {
    /// Storage on a shared connection.
    #[must_use]
    pub const fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl AppStorage for RedisAppStorage {
    async fn app_by_id(&self, id: &str) -> IdentityResult<App> {
        self.backend
            .get_json(&self.backend.key("app", id), "app_by_id")
            .await?
            .ok_or(IdentityError::AppNotFound)
    }

    async fn add_new_app(&self, mut app: App) -> IdentityResult<App> {
        if app.id.is_empty() {
            app.id = new_id();
        }
        let key = self.backend.key("app", &app.id);
        if !self.backend.set_json(&key, &app, Some("NX"), "add_new_app").await? {
            return Err(IdentityError::AppAlreadyExists);
        }
        let _: () = self
            .backend
            .conn()
            .sadd(self.backend.set_key("apps"), &app.id)
            .await
            .map_err(|e| IdentityError::storage("add_new_app", e))?;
        Ok(app)
    }

    async fn update_app(&self, id: &str, mut app: App) -> IdentityResult<App> {
        app.id = id.to_string();
        let key = self.backend.key("app", id);
        if !self.backend.set_json(&key, &app, Some("XX"), "update_app").await? {
            return Err(IdentityError::AppNotFound);
        }
        Ok(app)
    }

    async fn delete_app(&self, id: &str) -> IdentityResult<()> {
        let mut conn = self.backend.conn();
        let removed: u64 = conn
            .del(self.backend.key("app", id))
            .await
            .map_err(|e| IdentityError::storage("delete_app", e))?;
        let _: () = conn
            .srem(self.backend.set_key("apps"), id)
            .await
            .map_err(|e| IdentityError::storage("delete_app", e))?;
        if removed == 0 {
            return Err(IdentityError::AppNotFound);
        }
        Ok(())
    }

    async fn fetch_apps(&self, filter: &str, skip: u64, limit: u64) -> IdentityResult<Page<App>> {
        let mut apps: Vec<App> = self.backend.load_all("app", "fetch_apps").await?;
        apps.retain(|app| matches_filter(&[&app.name], filter));
        apps.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(paginate(apps, skip, limit))
    }
}

/// [`UserStorage`] on Redis.
pub struct RedisUserStorage {
    backend: RedisBackend,
    save: Script,
}

/// Whether a save may create a user or must replace an existing one.
#[derive(Debug, Clone, Copy)]
enum SaveMode {
    Create,
    Update,
}

impl SaveMode {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

impl RedisUserStorage {
    /// Storage on a shared connection.
    #[must_use]
    pub fn new(backend: RedisBackend) -> Self {
        Self {
            backend,
            save: Script::new(SAVE_USER_SCRIPT),
        }
    }

    async fn id_by_index(&self, index: &str, value: &str, operation: &'static str) -> IdentityResult<Option<String>> {
        if value.is_empty() {
            return Ok(None);
        }
        self.backend
            .conn()
            .get(self.backend.key(index, value))
            .await
            .map_err(|e| IdentityError::storage(operation, e))
    }

    async fn release_index(&self, index: &str, value: &str, operation: &'static str) -> IdentityResult<()> {
        if value.is_empty() {
            return Ok(());
        }
        let _: () = self
            .backend
            .conn()
            .del(self.backend.key(index, value))
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        Ok(())
    }

    /// Write `user` and move its index keys in one step.
    async fn save(&self, user: &User, mode: SaveMode, operation: &'static str) -> IdentityResult<()> {
        let raw = serde_json::to_string(user).map_err(|e| IdentityError::internal(e.to_string()))?;
        let outcome: String = self
            .save
            .key(self.backend.key("user", &user.id))
            .key(self.backend.set_key("users"))
            .arg(&user.id)
            .arg(raw)
            .arg(mode.as_str())
            .arg(&user.username)
            .arg(&user.email)
            .arg(self.backend.key("user_name", ""))
            .arg(self.backend.key("user_email", ""))
            .invoke_async(&mut self.backend.conn())
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;

        match outcome.as_str() {
            "stored" => Ok(()),
            "username_taken" => Err(IdentityError::UsernameTaken),
            "email_taken" => Err(IdentityError::EmailTaken),
            "missing" => Err(IdentityError::UserNotFound),
            "duplicate" => Err(IdentityError::internal(format!("duplicate user id {}", user.id))),
            other => Err(IdentityError::storage(operation, format!("unexpected reply {other}"))),
        }
    }
}

#[async_trait]
impl UserStorage for RedisUserStorage {
    async fn user_by_id(&self, id: &str) -> IdentityResult<User> {
        self.backend
            .get_json(&self.backend.key("user", id), "user_by_id")
            .await?
            .ok_or(IdentityError::UserNotFound)
    }

    async fn user_by_email(&self, email: &str) -> IdentityResult<User> {
        let id = self
            .id_by_index("user_email", &normalize_email(email), "user_by_email")
            .await?
            .ok_or(IdentityError::UserNotFound)?;
        self.user_by_id(&id).await
    }

    async fn user_by_name_password(&self, username: &str, password: &str) -> IdentityResult<User> {
        let id = self
            .id_by_index("user_name", username, "user_by_name_password")
            .await?
            .ok_or(IdentityError::InvalidCredentials)?;
        let user = match self.user_by_id(&id).await {
            Err(IdentityError::UserNotFound) => return Err(IdentityError::InvalidCredentials),
            other => other?,
        };
        if verify_password_blocking(password.to_string(), user.password_hash.clone()).await {
            Ok(user)
        } else {
            Err(IdentityError::InvalidCredentials)
        }
    }

    async fn user_exists(&self, username: &str) -> IdentityResult<bool> {
        Ok(self.id_by_index("user_name", username, "user_exists").await?.is_some())
    }

    async fn add_new_user(&self, mut user: User, password: &str) -> IdentityResult<User> {
        if user.id.is_empty() {
            user.id = new_id();
        }
        user.email = normalize_email(&user.email);
        user.password_hash = hash_password_blocking(password.to_string()).await?;
        self.save(&user, SaveMode::Create, "add_new_user").await?;
        Ok(user)
    }

    async fn reset_password(&self, id: &str, password: &str) -> IdentityResult<()> {
        let mut user = self.user_by_id(id).await?;
        user.password_hash = hash_password_blocking(password.to_string()).await?;
        self.save(&user, SaveMode::Update, "reset_password").await
    }

    async fn update_user(&self, id: &str, update: UserUpdate) -> IdentityResult<User> {
        let mut user = self.user_by_id(id).await?;
        update.apply(&mut user);
        self.save(&user, SaveMode::Update, "update_user").await?;
        Ok(user)
    }

    async fn delete_user(&self, id: &str) -> IdentityResult<()> {
        let user = self.user_by_id(id).await?;
        let mut conn = self.backend.conn();
        let _: () = conn
            .del(self.backend.key("user", id))
            .await
            .map_err(|e| IdentityError::storage("delete_user", e))?;
        let _: () = conn
            .srem(self.backend.set_key("users"), id)
            .await
            .map_err(|e| IdentityError::storage("delete_user", e))?;
        self.release_index("user_name", &user.username, "delete_user").await?;
        self.release_index("user_email", &user.email, "delete_user").await
    }

    async fn fetch_users(&self, filter: &str, skip: u64, limit: u64) -> IdentityResult<Page<User>> {
        let mut users: Vec<User> = self.backend.load_all("user", "fetch_users").await?;
        users.retain(|user| matches_filter(&[&user.username, &user.email], filter));
        users.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.id.cmp(&b.id)));
        Ok(paginate(users, skip, limit))
    }
}

/// [`TokenStorage`] on Redis.
pub struct RedisTokenStorage {
    backend: RedisBackend,
    redeem: Script,
    revoke: Script,
}

impl RedisTokenStorage {
    /// Storage on a shared connection.
    #[must_use]
    pub fn new(backend: RedisBackend) -> Self {
        Self {
            backend,
            redeem: Script::new(REDEEM_SCRIPT),
            revoke: Script::new(REVOKE_SCRIPT),
        }
    }

    /// Revoke one record, returning its successor.
    async fn revoke_one(&self, token_id: &str, operation: &'static str) -> IdentityResult<Option<String>> {
        let successor: Option<String> = self
            .revoke
            .key(self.backend.key("refresh", token_id))
            .invoke_async(&mut self.backend.conn())
            .await
            .map_err(|e| IdentityError::storage(operation, e))?;
        Ok(successor)
    }
}

#[async_trait]
impl TokenStorage for RedisTokenStorage {
    async fn put(&self, token_id: &str, expires_at: i64) -> IdentityResult<()> {
        let key = self.backend.key("refresh", token_id);
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("state")
            .arg("valid")
            .arg("expires_at")
            .arg(expires_at)
            .ignore()
            .cmd("EXPIREAT")
            .arg(&key)
            .arg(expires_at)
            .ignore()
            .query_async(&mut self.backend.conn())
            .await
            .map_err(|e| IdentityError::storage("put_token", e))?;
        Ok(())
    }

    async fn is_valid(&self, token_id: &str) -> IdentityResult<bool> {
        let (state, expires_at): (Option<String>, Option<i64>) = redis::cmd("HMGET")
            .arg(self.backend.key("refresh", token_id))
            .arg("state")
            .arg("expires_at")
            .query_async(&mut self.backend.conn())
            .await
            .map_err(|e| IdentityError::storage("is_valid", e))?;
        Ok(state.as_deref() == Some("valid") && expires_at.is_some_and(|exp| unix_now() < exp))
    }

    async fn invalidate(&self, token_id: &str) -> IdentityResult<()> {
        self.revoke_one(token_id, "invalidate").await.map(|_| ())
    }

    async fn redeem(&self, token_id: &str, successor_id: &str, successor_expires_at: i64) -> IdentityResult<()> {
        let outcome: Vec<String> = self
            .redeem
            .key(self.backend.key("refresh", token_id))
            .key(self.backend.key("refresh", successor_id))
            .arg(unix_now())
            .arg(successor_id)
            .arg(successor_expires_at)
            .invoke_async(&mut self.backend.conn())
            .await
            .map_err(|e| IdentityError::storage("redeem", e))?;

        match outcome.first().map(String::as_str) {
            Some("redeemed") => Ok(()),
            Some("expired") => Err(IdentityError::TokenExpired),
            Some("rotated") => {
                let mut next = outcome.get(1).filter(|id| !id.is_empty()).cloned();
                for _ in 0..MAX_ROTATION_CHAIN {
                    let Some(id) = next.take() else { break };
                    next = self.revoke_one(&id, "redeem").await?;
                }
                Err(IdentityError::TokenReused)
            }
            _ => Err(IdentityError::TokenRevoked),
        }
    }

    async fn purge_expired(&self, _now: i64) -> IdentityResult<u64> {
        debug!("Refresh records expire natively in Redis");
        Ok(0)
    }
}

/// [`VerificationCodeStorage`] on Redis.
pub struct RedisVerificationCodeStorage {
    backend: RedisBackend,
    consume: Script,
}

impl RedisVerificationCodeStorage {
    /// Storage on a shared connection.
    #[must_use]
    pub fn new(backend: RedisBackend) -> Self {
        Self {
            backend,
            consume: Script::new(CONSUME_CODE_SCRIPT),
        }
    }

    fn code_key(&self, user_id: &str, purpose: CodePurpose) -> String {
        self.backend.key("code", &format!("{user_id}:{}", purpose.as_str()))
    }
}

#[async_trait]
impl VerificationCodeStorage for RedisVerificationCodeStorage {
    async fn create_code(&self, code: VerificationCode) -> IdentityResult<()> {
        let key = self.code_key(&code.user_id, code.purpose);
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .cmd("HSET")
            .arg(&key)
            .arg("code")
            .arg(&code.code)
            .arg("expires_at")
            .arg(code.expires_at)
            .ignore()
            .cmd("EXPIREAT")
            .arg(&key)
            .arg(code.expires_at)
            .ignore()
            .query_async(&mut self.backend.conn())
            .await
            .map_err(|e| IdentityError::storage("create_code", e))?;
        Ok(())
    }

    async fn consume_code(&self, user_id: &str, purpose: CodePurpose, code: &str) -> IdentityResult<()> {
        let consumed: i64 = self
            .consume
            .key(self.code_key(user_id, purpose))
            .arg(code)
            .arg(unix_now())
            .invoke_async(&mut self.backend.conn())
            .await
            .map_err(|e| IdentityError::storage("consume_code", e))?;
        if consumed == 1 {
            Ok(())
        } else {
            Err(IdentityError::VerificationCodeInvalid)
        }
    }
}
