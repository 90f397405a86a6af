//! Registered client applications.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Client platform of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    /// Browser based
    #[default]
    Web,
    /// Android
    Android,
    /// iOS
    Ios,
    /// Desktop
    Desktop,
}

/// Two-factor authentication requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TfaStatus {
    /// Not offered
    #[default]
    Disabled,
    /// Users may enable it
    Optional,
    /// Required for every user
    Mandatory,
}

/// Where authorization decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorizationWay {
    /// No authorization beyond scopes
    #[default]
    NoAuthz,
    /// Policy evaluated by this service
    Internal,
    /// Delegated to an external service
    External,
}

/// Sign in with Apple credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppleInfo {
    /// Services id
    pub client_id: String,
    /// Signed client secret
    pub client_secret: String,
}

/// A registered client application.
///
/// Lifespans are in seconds; zero or negative values fall back to the
/// token service defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct App {
    /// Client id, the audience of its tokens
    pub id: String,
    /// Client secret, compared in constant time
    pub secret: String,
    /// Inactive apps cannot obtain tokens
    pub active: bool,
    /// Display name
    pub name: String,
    /// Free text
    pub description: String,
    /// Scopes tokens for this app may carry
    pub scopes: Vec<String>,
    /// May receive refresh tokens
    pub offline: bool,
    /// Client platform
    #[serde(rename = "type")]
    pub app_type: AppType,
    /// Allowed redirect targets
    pub redirect_urls: Vec<String>,
    /// Access and id token lifetime
    pub token_lifespan: i64,
    /// Refresh token lifetime
    pub refresh_token_lifespan: i64,
    /// Invite token lifetime
    pub invite_token_lifespan: i64,
    /// User fields that may be copied into token payloads
    pub token_payload: Vec<String>,
    /// New users may not sign up
    pub registration_forbidden: bool,
    /// Users may sign up without credentials
    pub anonymous_registration_allowed: bool,
    /// Two-factor requirement
    pub tfa_status: TfaStatus,
    /// Fixed TFA code for test environments
    pub debug_tfa_code: String,
    /// Where authorization is decided
    pub authorization_way: AuthorizationWay,
    /// Authorization model source
    pub authorization_model: String,
    /// Authorization policy source
    pub authorization_policy: String,
    /// Roles new users may be given
    pub roles_whitelist: Vec<String>,
    /// Roles new users may never be given
    pub roles_blacklist: Vec<String>,
    /// Role given to new users
    pub new_user_default_role: String,
    /// Sign in with Apple settings
    pub apple_info: Option<AppleInfo>,
    /// Refresh tokens of this app are reusable until they expire
    pub refresh_rotation_exempt: bool,
}

impl App {
    /// Copy safe to hand to clients: secrets and policy internals removed.
    #[must_use]
    pub fn sanitized(&self) -> Self {
        let mut app = self.clone();
        app.secret.clear();
        if let Some(apple) = app.apple_info.as_mut() {
            apple.client_secret.clear();
        }
        app.authorization_way = AuthorizationWay::NoAuthz;
        app.authorization_model.clear();
        app.authorization_policy.clear();
        app
    }

    /// Constant time secret comparison.
    #[must_use]
    pub fn secret_matches(&self, candidate: &str) -> bool {
        !self.secret.is_empty() && bool::from(self.secret.as_bytes().ct_eq(candidate.as_bytes()))
    }

    /// Whether `scope` is among the app's allowed scopes.
    #[must_use]
    pub fn allows_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}
