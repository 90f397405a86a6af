//! Startup wiring: settings in, keys and storages and a token service out.
//!
//! [`DatabaseComposer`] puts every storage category on one backend.
//! [`PartialComposer`] fills in-memory storage for the categories configured
//! as fake and takes the rest from the caller.

mod backend;
mod full;
mod partial;

use std::fmt;
use std::sync::Arc;

use identity_common::{RetryConfig, RetryPolicy};
use tracing::info;

pub use backend::Backend;
pub use full::DatabaseComposer;
pub use partial::{PartialComposer, StorageFactory};

use crate::config::{KeySettings, ServerSettings};
use crate::error::{IdentityError, IdentityResult};
use crate::keys::{KeyMaterial, SigningAlgorithm};
use crate::service::TokenService;
use crate::storage::{AppStorage, TokenStorage, UserStorage, VerificationCodeStorage};

/// Lifecycle of a composer. `Composed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComposerState {
    /// Nothing attempted yet
    #[default]
    Unconfigured,
    /// Keys and backends are being set up
    Composing,
    /// Storages and token service are ready
    Composed,
    /// Setup failed; the composer cannot be reused
    Failed,
}

impl fmt::Display for ComposerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconfigured => "unconfigured",
            Self::Composing => "composing",
            Self::Composed => "composed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything a server needs, ready to share across tasks.
#[derive(Clone)]
pub struct Composition {
    app_storage: Arc<dyn AppStorage>,
    user_storage: Arc<dyn UserStorage>,
    token_storage: Arc<dyn TokenStorage>,
    verification_code_storage: Arc<dyn VerificationCodeStorage>,
    token_service: Arc<TokenService>,
}

impl Composition {
    /// Composed app storage.
    #[must_use]
    pub fn app_storage(&self) -> &Arc<dyn AppStorage> {
        &self.app_storage
    }

    /// Composed user storage.
    #[must_use]
    pub fn user_storage(&self) -> &Arc<dyn UserStorage> {
        &self.user_storage
    }

    /// Composed token storage.
    #[must_use]
    pub fn token_storage(&self) -> &Arc<dyn TokenStorage> {
        &self.token_storage
    }

    /// Composed verification code storage.
    #[must_use]
    pub fn verification_code_storage(&self) -> &Arc<dyn VerificationCodeStorage> {
        &self.verification_code_storage
    }

    /// Token service bound to these storages.
    #[must_use]
    pub fn token_service(&self) -> &Arc<TokenService> {
        &self.token_service
    }
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("issuer", &self.token_service.issuer())
            .finish_non_exhaustive()
    }
}

/// Connection retries for startup. Storage calls after startup are not
/// retried.
pub(crate) fn startup_retry() -> RetryPolicy {
    RetryPolicy::new(RetryConfig::default().with_max_retries(2))
}

/// Resolve the algorithm name and load the key pair.
///
/// Missing key files are a configuration problem; unreadable or malformed
/// ones are a key loading problem.
pub(crate) fn load_keys(keys: &KeySettings) -> IdentityResult<KeyMaterial> {
    let algorithm = SigningAlgorithm::from_name(&keys.algorithm)?;
    for path in [&keys.private_key, &keys.public_key] {
        if !path.exists() {
            return Err(IdentityError::config(format!("Key file not found: {}", path.display())));
        }
    }
    KeyMaterial::from_files(&keys.private_key, &keys.public_key, algorithm)
}

pub(crate) fn assemble(
    settings: &ServerSettings,
    keys: KeyMaterial,
    app_storage: Arc<dyn AppStorage>,
    user_storage: Arc<dyn UserStorage>,
    token_storage: Arc<dyn TokenStorage>,
    verification_code_storage: Arc<dyn VerificationCodeStorage>,
) -> Composition {
    let token_service = TokenService::new(
        keys,
        settings.issuer.clone(),
        Arc::clone(&app_storage),
        Arc::clone(&user_storage),
        Arc::clone(&token_storage),
    )
    .with_storage_timeout(settings.storage_timeout)
    .with_web_cookie_ttl(settings.web_cookie_token_ttl);

    info!(issuer = %settings.issuer, "Token service ready");
    Composition {
        app_storage,
        user_storage,
        token_storage,
        verification_code_storage,
        token_service: Arc::new(token_service),
    }
}
