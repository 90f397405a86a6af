use std::sync::Arc;
use std::time::Duration;

use identity_common::{with_deadline, RetryPolicy};
use tracing::info;

use crate::config::{DatabaseSettings, DatabaseType};
use crate::error::{IdentityError, IdentityResult};
use crate::storage::document::{
    SurrealAppStorage, SurrealBackend, SurrealTokenStorage, SurrealUserStorage, SurrealVerificationCodeStorage,
};
use crate::storage::keyvalue::{
    RedisAppStorage, RedisBackend, RedisTokenStorage, RedisUserStorage, RedisVerificationCodeStorage,
};
use crate::storage::memory::{
    MemoryAppStorage, MemoryTokenStorage, MemoryUserStorage, MemoryVerificationCodeStorage,
};
use crate::storage::{AppStorage, TokenStorage, UserStorage, VerificationCodeStorage};

/// A connected storage technology, able to hand out every storage category.
///
/// Cloning shares the underlying connection. The fake backend hands out a
/// fresh empty store on every call.
#[derive(Clone)]
pub enum Backend {
    /// In-memory storage
    Fake,
    /// SurrealDB
    DocumentStore(SurrealBackend),
    /// Redis
    KeyValueStore(RedisBackend),
}

impl Backend {
    /// # Errors
    ///
    /// Whatever the backend's own `connect` reports.
    pub async fn connect(settings: &DatabaseSettings) -> IdentityResult<Self> {
        match settings.db_type {
            DatabaseType::Fake => Ok(Self::Fake),
            DatabaseType::DocumentStore => Ok(Self::DocumentStore(SurrealBackend::connect(settings).await?)),
            DatabaseType::KeyValueStore => Ok(Self::KeyValueStore(RedisBackend::connect(settings).await?)),
        }
    }

    /// Connect with each attempt bounded by `timeout`, retrying transient
    /// failures per `retry`.
    ///
    /// # Errors
    ///
    /// The last attempt's error once retries are exhausted, or the first
    /// non-transient one.
    pub async fn connect_with_retry(
        settings: &DatabaseSettings,
        retry: &RetryPolicy,
        timeout: Duration,
    ) -> IdentityResult<Self> {
        let backend = retry
            .execute(|| async move {
                with_deadline(timeout, Self::connect(settings))
                    .await
                    .map_err(|e| IdentityError::storage("connect", e))?
            })
            .await?;
        info!(backend = %settings.db_type, "Storage backend connected");
        Ok(backend)
    }

    /// Technology of this backend.
    #[must_use]
    pub const fn db_type(&self) -> DatabaseType {
        match self {
            Self::Fake => DatabaseType::Fake,
            Self::DocumentStore(_) => DatabaseType::DocumentStore,
            Self::KeyValueStore(_) => DatabaseType::KeyValueStore,
        }
    }

    /// App storage on this backend.
    #[must_use]
    pub fn app_storage(&self) -> Arc<dyn AppStorage> {
        match self {
            Self::Fake => Arc::new(MemoryAppStorage::new()),
            Self::DocumentStore(db) => Arc::new(SurrealAppStorage::new(db.clone())),
            Self::KeyValueStore(redis) => Arc::new(RedisAppStorage::new(redis.clone())),
        }
    }

    /// User storage on this backend.
    #[must_use]
    pub fn user_storage(&self) -> Arc<dyn UserStorage> {
        match self {
            Self::Fake => Arc::new(MemoryUserStorage::new()),
            Self::DocumentStore(db) => Arc::new(SurrealUserStorage::new(db.clone())),
            Self::KeyValueStore(redis) => Arc::new(RedisUserStorage::new(redis.clone())),
        }
    }

    /// Token storage on this backend.
    #[must_use]
    pub fn token_storage(&self) -> Arc<dyn TokenStorage> {
        match self {
            Self::Fake => Arc::new(MemoryTokenStorage::new()),
            Self::DocumentStore(db) => Arc::new(SurrealTokenStorage::new(db.clone())),
            Self::KeyValueStore(redis) => Arc::new(RedisTokenStorage::new(redis.clone())),
        }
    }

    /// Verification code storage on this backend.
    #[must_use]
    pub fn verification_code_storage(&self) -> Arc<dyn VerificationCodeStorage> {
        match self {
            Self::Fake => Arc::new(MemoryVerificationCodeStorage::new()),
            Self::DocumentStore(db) => Arc::new(SurrealVerificationCodeStorage::new(db.clone())),
            Self::KeyValueStore(redis) => Arc::new(RedisVerificationCodeStorage::new(redis.clone())),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Backend").field(&self.db_type()).finish()
    }
}
