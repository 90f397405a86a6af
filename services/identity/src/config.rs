//! Service configuration.
//!
//! Everything is read from environment variables (optionally seeded from a
//! `.env` file) and validated at startup. Per-category storage variables
//! override the shared `STORAGE_*` settings.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, IdentityResult};
use crate::storage::StorageCategory;

/// Persistence technology backing a storage category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseType {
    /// Process-local maps, lost on restart
    #[default]
    #[serde(alias = "memory")]
    Fake,
    /// SurrealDB
    #[serde(alias = "surrealdb")]
    DocumentStore,
    /// Redis
    #[serde(alias = "redis")]
    KeyValueStore,
}

impl DatabaseType {
    /// Name used in settings and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fake => "fake",
            Self::DocumentStore => "document-store",
            Self::KeyValueStore => "key-value-store",
        }
    }
}

impl FromStr for DatabaseType {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fake" | "memory" => Ok(Self::Fake),
            "document-store" | "surrealdb" => Ok(Self::DocumentStore),
            "key-value-store" | "redis" => Ok(Self::KeyValueStore),
            other => Err(IdentityError::config(format!("Unknown storage type: {other}"))),
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection settings for one backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Backend technology
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    /// `mem://` or `ws://host:port` for the document store,
    /// `redis://host:port` for the key-value store
    pub endpoint: String,
    /// Namespace/database for the document store, key prefix for the
    /// key-value store
    pub name: String,
    /// Document store root credentials
    #[serde(default)]
    pub username: Option<String>,
    /// Never printed by `Debug`
    #[serde(default)]
    pub password: Option<String>,
}

impl DatabaseSettings {
    /// In-memory backend; nothing is persisted.
    #[must_use]
    pub fn fake() -> Self {
        Self {
            db_type: DatabaseType::Fake,
            endpoint: String::new(),
            name: "identity".to_string(),
            username: None,
            password: None,
        }
    }

    /// Settings without credentials.
    #[must_use]
    pub fn new(db_type: DatabaseType, endpoint: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            db_type,
            endpoint: endpoint.into(),
            name: name.into(),
            username: None,
            password: None,
        }
    }

    /// Sign in with these credentials on connect.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Same connection, different technology.
    #[must_use]
    pub fn with_type(mut self, db_type: DatabaseType) -> Self {
        self.db_type = db_type;
        self
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self::fake()
    }
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("db_type", &self.db_type)
            .field("endpoint", &self.endpoint)
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Backend choice per storage category.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// App registry backend
    pub app: DatabaseSettings,
    /// User account backend
    pub user: DatabaseSettings,
    /// Refresh record backend
    pub token: DatabaseSettings,
    /// Verification code backend
    pub verification_code: DatabaseSettings,
}

impl StorageSettings {
    /// Every category on the same backend.
    #[must_use]
    pub fn uniform(database: &DatabaseSettings) -> Self {
        Self {
            app: database.clone(),
            user: database.clone(),
            token: database.clone(),
            verification_code: database.clone(),
        }
    }

    /// Settings for one category.
    #[must_use]
    pub const fn get(&self, category: StorageCategory) -> &DatabaseSettings {
        match category {
            StorageCategory::App => &self.app,
            StorageCategory::User => &self.user,
            StorageCategory::Token => &self.token,
            StorageCategory::VerificationCode => &self.verification_code,
        }
    }

    /// Replace the settings for one category.
    pub fn set(&mut self, category: StorageCategory, settings: DatabaseSettings) {
        match category {
            StorageCategory::App => self.app = settings,
            StorageCategory::User => self.user = settings,
            StorageCategory::Token => self.token = settings,
            StorageCategory::VerificationCode => self.verification_code = settings,
        }
    }
}

/// Signing key locations and algorithm selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySettings {
    /// PEM file of the signing key
    pub private_key: PathBuf,
    /// PEM file of the matching public key
    pub public_key: PathBuf,
    /// `auto` or an explicit algorithm name, resolved at composition time
    pub algorithm: String,
}

impl KeySettings {
    /// Key files plus algorithm name.
    #[must_use]
    pub fn new(private_key: impl Into<PathBuf>, public_key: impl Into<PathBuf>, algorithm: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            public_key: public_key.into(),
            algorithm: algorithm.into(),
        }
    }
}

/// Identity service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// `iss` claim of every minted token
    pub issuer: String,
    /// Signing key configuration
    pub keys: KeySettings,
    /// Backend used by the full composer for every category
    pub database: DatabaseSettings,
    /// Per-category backends used by the partial composer
    pub storage: StorageSettings,
    /// Upper bound for a single storage call, zero disables it
    pub storage_timeout: Duration,
    /// Lifetime of web session cookie tokens in seconds
    pub web_cookie_token_ttl: i64,
    /// Period of the expired refresh record purge
    pub cleanup_interval: Duration,
}

impl ServerSettings {
    /// Settings with defaults for everything but the issuer, keys and backend.
    #[must_use]
    pub fn new(issuer: impl Into<String>, keys: KeySettings, database: DatabaseSettings) -> Self {
        Self {
            issuer: issuer.into(),
            keys,
            storage: StorageSettings::uniform(&database),
            database,
            storage_timeout: Duration::from_secs(5),
            web_cookie_token_ttl: DEFAULT_WEB_COOKIE_TOKEN_TTL,
            cleanup_interval: Duration::from_secs(300),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but invalid.
    pub fn from_env() -> IdentityResult<Self> {
        dotenvy::dotenv().ok();

        let issuer = env::var("IDENTITY_ISSUER").unwrap_or_else(|_| "http://localhost:8081".to_string());

        let pem_folder = PathBuf::from(env::var("IDENTITY_PEM_FOLDER").unwrap_or_else(|_| "./jwt".to_string()));
        let keys = KeySettings::new(
            pem_folder.join(env::var("IDENTITY_PRIVATE_KEY").unwrap_or_else(|_| "private.pem".to_string())),
            pem_folder.join(env::var("IDENTITY_PUBLIC_KEY").unwrap_or_else(|_| "public.pem".to_string())),
            env::var("IDENTITY_ALGORITHM").unwrap_or_else(|_| "auto".to_string()),
        );

        let mut database = DatabaseSettings::new(
            parse_env("STORAGE_TYPE", DatabaseType::Fake)?,
            env::var("STORAGE_ENDPOINT").unwrap_or_default(),
            env::var("STORAGE_NAME").unwrap_or_else(|_| "identity".to_string()),
        );
        database.username = env::var("STORAGE_USERNAME").ok();
        database.password = env::var("STORAGE_PASSWORD").ok();

        let mut storage = StorageSettings::uniform(&database);
        for (category, var) in [
            (StorageCategory::App, "APP_STORAGE_TYPE"),
            (StorageCategory::User, "USER_STORAGE_TYPE"),
            (StorageCategory::Token, "TOKEN_STORAGE_TYPE"),
            (StorageCategory::VerificationCode, "VERIFICATION_CODE_STORAGE_TYPE"),
        ] {
            let db_type = parse_env(var, database.db_type)?;
            storage.set(category, database.clone().with_type(db_type));
        }

        Ok(Self {
            issuer,
            keys,
            database,
            storage,
            storage_timeout: Duration::from_millis(parse_env("STORAGE_TIMEOUT_MS", 5000)?),
            web_cookie_token_ttl: parse_env("WEB_COOKIE_TOKEN_TTL", DEFAULT_WEB_COOKIE_TOKEN_TTL)?,
            cleanup_interval: Duration::from_secs(parse_env("CLEANUP_INTERVAL_SECS", 300)?),
        })
    }
}

/// Web session cookies live for an hour unless configured otherwise.
pub const DEFAULT_WEB_COOKIE_TOKEN_TTL: i64 = 3600;

/// Parse environment variable with default value.
fn parse_env<T: FromStr>(name: &str, default: T) -> IdentityResult<T>
where
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .parse()
            .map_err(|e| IdentityError::config(format!("Invalid {name}: {e}"))),
        Err(_) => Ok(default),
    }
}
