use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error, info};

use super::{assemble, load_keys, startup_retry, Backend, ComposerState, Composition};
use crate::config::{DatabaseSettings, DatabaseType, ServerSettings, StorageSettings};
use crate::error::{IdentityError, IdentityResult};
use crate::storage::memory::{
    MemoryAppStorage, MemoryTokenStorage, MemoryUserStorage, MemoryVerificationCodeStorage,
};
use crate::storage::{AppStorage, StorageCategory, TokenStorage, UserStorage, VerificationCodeStorage};

/// Produces a storage on demand. Invoked at most once per access.
pub type StorageFactory<T> = Box<dyn Fn() -> BoxFuture<'static, IdentityResult<Arc<T>>> + Send + Sync>;

fn shared<T: ?Sized + Send + Sync + 'static>(storage: Arc<T>) -> StorageFactory<T> {
    Box::new(move || {
        let storage = Arc::clone(&storage);
        async move { Ok::<_, IdentityError>(storage) }.boxed()
    })
}

fn boxed<T, F, Fut>(factory: F) -> StorageFactory<T>
where
    T: ?Sized + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = IdentityResult<Arc<T>>> + Send + 'static,
{
    Box::new(move || factory().boxed())
}

/// Mixes in-memory storage with storage supplied by the caller.
///
/// `new` fills exactly the categories configured as fake. The remaining
/// slots stay empty until a `with_*` call supplies them, and asking for an
/// empty slot is an `UnconfiguredStorage` error.
#[derive(Default)]
pub struct PartialComposer {
    app: Option<StorageFactory<dyn AppStorage>>,
    user: Option<StorageFactory<dyn UserStorage>>,
    token: Option<StorageFactory<dyn TokenStorage>>,
    verification_code: Option<StorageFactory<dyn VerificationCodeStorage>>,
    state: ComposerState,
}

impl PartialComposer {
    /// Composer with the fake categories of `settings` already filled.
    #[must_use]
    pub fn new(settings: &StorageSettings) -> Self {
        let is_fake = |category| settings.get(category).db_type == DatabaseType::Fake;
        let mut composer = Self::default();

        if is_fake(StorageCategory::App) {
            composer.app = Some(shared::<dyn AppStorage>(Arc::new(MemoryAppStorage::new())));
        }
        if is_fake(StorageCategory::User) {
            composer.user = Some(shared::<dyn UserStorage>(Arc::new(MemoryUserStorage::new())));
        }
        if is_fake(StorageCategory::Token) {
            composer.token = Some(shared::<dyn TokenStorage>(Arc::new(MemoryTokenStorage::new())));
        }
        if is_fake(StorageCategory::VerificationCode) {
            composer.verification_code = Some(shared::<dyn VerificationCodeStorage>(Arc::new(
                MemoryVerificationCodeStorage::new(),
            )));
        }

        for category in StorageCategory::ALL {
            if is_fake(category) {
                debug!(%category, "Filled with in-memory storage");
            }
        }
        composer
    }

    /// Supply app storage.
    #[must_use]
    pub fn with_app_storage<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IdentityResult<Arc<dyn AppStorage>>> + Send + 'static,
    {
        self.app = Some(boxed(factory));
        self
    }

    /// Supply user storage.
    #[must_use]
    pub fn with_user_storage<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IdentityResult<Arc<dyn UserStorage>>> + Send + 'static,
    {
        self.user = Some(boxed(factory));
        self
    }

    /// Supply token storage.
    #[must_use]
    pub fn with_token_storage<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IdentityResult<Arc<dyn TokenStorage>>> + Send + 'static,
    {
        self.token = Some(boxed(factory));
        self
    }

    /// Supply verification code storage.
    #[must_use]
    pub fn with_verification_code_storage<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IdentityResult<Arc<dyn VerificationCodeStorage>>> + Send + 'static,
    {
        self.verification_code = Some(boxed(factory));
        self
    }

    /// Supply every still-empty slot from the backend its settings name.
    /// Connections are opened when a slot is first asked for, and each
    /// category gets its own connection.
    #[must_use]
    pub fn with_configured_backends(mut self, settings: &StorageSettings, timeout: Duration) -> Self {
        if self.app.is_none() {
            let db = settings.app.clone();
            self.app = Some(boxed(move || {
                let db = db.clone();
                async move { Ok::<_, IdentityError>(connect(&db, timeout).await?.app_storage()) }
            }));
        }
        if self.user.is_none() {
            let db = settings.user.clone();
            self.user = Some(boxed(move || {
                let db = db.clone();
                async move { Ok::<_, IdentityError>(connect(&db, timeout).await?.user_storage()) }
            }));
        }
        if self.token.is_none() {
            let db = settings.token.clone();
            self.token = Some(boxed(move || {
                let db = db.clone();
                async move { Ok::<_, IdentityError>(connect(&db, timeout).await?.token_storage()) }
            }));
        }
        if self.verification_code.is_none() {
            let db = settings.verification_code.clone();
            self.verification_code = Some(boxed(move || {
                let db = db.clone();
                async move { Ok::<_, IdentityError>(connect(&db, timeout).await?.verification_code_storage()) }
            }));
        }
        self
    }

    /// True when `category` has a storage or factory.
    #[must_use]
    pub fn is_configured(&self, category: StorageCategory) -> bool {
        match category {
            StorageCategory::App => self.app.is_some(),
            StorageCategory::User => self.user.is_some(),
            StorageCategory::Token => self.token.is_some(),
            StorageCategory::VerificationCode => self.verification_code.is_some(),
        }
    }

    /// # Errors
    ///
    /// `UnconfiguredStorage` for an empty slot, or the factory's error.
    pub async fn app_storage(&self) -> IdentityResult<Arc<dyn AppStorage>> {
        let factory = self
            .app
            .as_ref()
            .ok_or(IdentityError::UnconfiguredStorage(StorageCategory::App))?;
        factory().await
    }

    /// # Errors
    ///
    /// `UnconfiguredStorage` for an empty slot, or the factory's error.
    pub async fn user_storage(&self) -> IdentityResult<Arc<dyn UserStorage>> {
        let factory = self
            .user
            .as_ref()
            .ok_or(IdentityError::UnconfiguredStorage(StorageCategory::User))?;
        factory().await
    }

    /// # Errors
    ///
    /// `UnconfiguredStorage` for an empty slot, or the factory's error.
    pub async fn token_storage(&self) -> IdentityResult<Arc<dyn TokenStorage>> {
        let factory = self
            .token
            .as_ref()
            .ok_or(IdentityError::UnconfiguredStorage(StorageCategory::Token))?;
        factory().await
    }

    /// # Errors
    ///
    /// `UnconfiguredStorage` for an empty slot, or the factory's error.
    pub async fn verification_code_storage(&self) -> IdentityResult<Arc<dyn VerificationCodeStorage>> {
        let factory = self
            .verification_code
            .as_ref()
            .ok_or(IdentityError::UnconfiguredStorage(StorageCategory::VerificationCode))?;
        factory().await
    }

    /// Load keys, resolve every slot and build the token service.
    ///
    /// # Errors
    ///
    /// Key errors as for [`super::DatabaseComposer::compose`], then the
    /// first slot that is empty or whose factory fails.
    pub async fn compose(&mut self, settings: &ServerSettings) -> IdentityResult<Composition> {
        if self.state != ComposerState::Unconfigured {
            return Err(IdentityError::config(format!("Composer already {}", self.state)));
        }
        self.transition(ComposerState::Composing);

        match self.build(settings).await {
            Ok(composition) => {
                self.transition(ComposerState::Composed);
                Ok(composition)
            }
            Err(err) => {
                error!(error = %err, code = err.code(), "Partial composition failed");
                self.transition(ComposerState::Failed);
                Err(err)
            }
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ComposerState {
        self.state
    }

    async fn build(&self, settings: &ServerSettings) -> IdentityResult<Composition> {
        let keys = load_keys(&settings.keys)?;
        let app_storage = self.app_storage().await?;
        let user_storage = self.user_storage().await?;
        let token_storage = self.token_storage().await?;
        let verification_code_storage = self.verification_code_storage().await?;

        Ok(assemble(
            settings,
            keys,
            app_storage,
            user_storage,
            token_storage,
            verification_code_storage,
        ))
    }

    fn transition(&mut self, next: ComposerState) {
        info!(from = %self.state, to = %next, "Partial composer state change");
        self.state = next;
    }
}

async fn connect(settings: &DatabaseSettings, timeout: Duration) -> IdentityResult<Backend> {
    Backend::connect_with_retry(settings, &startup_retry(), timeout).await
}

impl std::fmt::Debug for PartialComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialComposer")
            .field("app", &self.app.is_some())
            .field("user", &self.user.is_some())
            .field("token", &self.token.is_some())
            .field("verification_code", &self.verification_code.is_some())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::App;

    fn mixed() -> StorageSettings {
        let mut settings = StorageSettings::uniform(&DatabaseSettings::fake());
        settings.set(
            StorageCategory::Token,
            DatabaseSettings::new(DatabaseType::KeyValueStore, "redis://127.0.0.1:1", "identity"),
        );
        settings
    }

    #[tokio::test]
    async fn test_fills_only_fake_categories() {
        let composer = PartialComposer::new(&mixed());
        assert!(composer.is_configured(StorageCategory::App));
        assert!(composer.is_configured(StorageCategory::User));
        assert!(composer.is_configured(StorageCategory::VerificationCode));
        assert!(!composer.is_configured(StorageCategory::Token));

        let err = composer.token_storage().await.err().unwrap();
        assert!(matches!(err, IdentityError::UnconfiguredStorage(StorageCategory::Token)));
    }

    #[tokio::test]
    async fn test_fake_slot_is_shared_between_accesses() {
        let composer = PartialComposer::new(&StorageSettings::uniform(&DatabaseSettings::fake()));
        let first = composer.app_storage().await.unwrap();
        first
            .add_new_app(App {
                id: "shared".into(),
                ..App::default()
            })
            .await
            .unwrap();
        let second = composer.app_storage().await.unwrap();
        assert!(second.app_by_id("shared").await.is_ok());
    }

    #[tokio::test]
    async fn test_supplied_factory_fills_slot() {
        let composer = PartialComposer::new(&mixed()).with_token_storage(|| async {
            Ok::<_, IdentityError>(Arc::new(MemoryTokenStorage::new()) as Arc<dyn TokenStorage>)
        });
        assert!(composer.is_configured(StorageCategory::Token));
        assert!(composer.token_storage().await.is_ok());
    }
}
