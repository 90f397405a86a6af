use tracing::{error, info};

use super::{assemble, load_keys, startup_retry, Backend, ComposerState, Composition};
use crate::config::ServerSettings;
use crate::error::{IdentityError, IdentityResult};

/// Composes every storage category on the single backend named by
/// `settings.database`.
#[derive(Debug)]
pub struct DatabaseComposer {
    settings: ServerSettings,
    state: ComposerState,
}

impl DatabaseComposer {
    /// Composer for `settings`, not yet composed.
    #[must_use]
    pub const fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            state: ComposerState::Unconfigured,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ComposerState {
        self.state
    }

    /// Load keys, connect the backend and build the token service.
    ///
    /// A composer composes once. Calling this again, whether the first call
    /// succeeded or failed, is a `Configuration` error.
    ///
    /// # Errors
    ///
    /// `Configuration` for a bad algorithm name or missing key file,
    /// `KeyLoad` or `AlgorithmMismatch` for unusable keys, and
    /// `StorageUnavailable` when the backend cannot be reached.
    pub async fn compose(&mut self) -> IdentityResult<Composition> {
        if self.state != ComposerState::Unconfigured {
            return Err(IdentityError::config(format!("Composer already {}", self.state)));
        }
        self.transition(ComposerState::Composing);

        match self.build().await {
            Ok(composition) => {
                self.transition(ComposerState::Composed);
                Ok(composition)
            }
            Err(err) => {
                error!(error = %err, code = err.code(), "Composition failed");
                self.transition(ComposerState::Failed);
                Err(err)
            }
        }
    }

    async fn build(&self) -> IdentityResult<Composition> {
        let keys = load_keys(&self.settings.keys)?;
        let backend = Backend::connect_with_retry(
            &self.settings.database,
            &startup_retry(),
            self.settings.storage_timeout,
        )
        .await?;

        Ok(assemble(
            &self.settings,
            keys,
            backend.app_storage(),
            backend.user_storage(),
            backend.token_storage(),
            backend.verification_code_storage(),
        ))
    }

    fn transition(&mut self, next: ComposerState) {
        info!(from = %self.state, to = %next, backend = %self.settings.database.db_type, "Composer state change");
        self.state = next;
    }
}
