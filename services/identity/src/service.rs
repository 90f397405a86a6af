//! Token issuance, parsing and refresh rotation.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use identity_common::with_deadline;
use jsonwebtoken::Header;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_WEB_COOKIE_TOKEN_TTL;
use crate::error::{IdentityError, IdentityResult};
use crate::jwt::{Token, TokenBuilder, TokenType};
use crate::keys::{KeyMaterial, PublicKey};
use crate::model::{App, User};
use crate::storage::{intersect_scopes, AppStorage, TokenStorage, UserStorage};
use crate::validator::Validator;

/// Access and id token lifetime when the app sets none.
pub const DEFAULT_TOKEN_LIFESPAN: i64 = 2 * 60 * 60;
/// Refresh token lifetime when the app sets none.
pub const DEFAULT_REFRESH_TOKEN_LIFESPAN: i64 = 30 * 24 * 60 * 60;
/// Invite token lifetime when the app sets none.
pub const DEFAULT_INVITE_TOKEN_LIFESPAN: i64 = 60 * 60;

/// Result of [`TokenService::new_access_token`].
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedTokens {
    /// Access token for the app
    pub access_token: Token,
    /// Present when offline access was requested and the app allows it
    pub refresh_token: Option<Token>,
}

/// Result of [`TokenService::renew_token`].
#[derive(Debug, Clone, PartialEq)]
pub struct RenewedTokens {
    /// Fresh access token
    pub access_token: Token,
    /// Replacement for the presented refresh token
    pub refresh_token: Token,
}

/// Mints, signs and parses tokens and rotates refresh tokens.
///
/// Holds no mutable state of its own; refresh token liveness lives in the
/// token storage.
pub struct TokenService {
    keys: KeyMaterial,
    issuer: String,
    app_storage: Arc<dyn AppStorage>,
    user_storage: Arc<dyn UserStorage>,
    token_storage: Arc<dyn TokenStorage>,
    storage_timeout: Duration,
    web_cookie_ttl: i64,
}

fn lifespan(configured: i64, default: i64) -> i64 {
    if configured > 0 {
        configured
    } else {
        default
    }
}

fn ensure_active(app: &App) -> IdentityResult<()> {
    if app.active {
        Ok(())
    } else {
        Err(IdentityError::AppInactive)
    }
}

/// User fields the app allows into token payloads.
fn payload_for(user: &User, app: &App) -> BTreeMap<String, serde_json::Value> {
    app.token_payload
        .iter()
        .filter_map(|name| user.payload_field(name).map(|value| (name.clone(), value)))
        .collect()
}

impl TokenService {
    /// Service signing with `keys` as `issuer`. Storage calls time out after five seconds.
    pub fn new(
        keys: KeyMaterial,
        issuer: impl Into<String>,
        app_storage: Arc<dyn AppStorage>,
        user_storage: Arc<dyn UserStorage>,
        token_storage: Arc<dyn TokenStorage>,
    ) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            app_storage,
            user_storage,
            token_storage,
            storage_timeout: Duration::from_secs(5),
            web_cookie_ttl: DEFAULT_WEB_COOKIE_TOKEN_TTL,
        }
    }

    /// Bound every storage call; zero disables the bound.
    #[must_use]
    pub const fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    /// Lifetime of web cookie tokens in seconds.
    #[must_use]
    pub const fn with_web_cookie_ttl(mut self, ttl_seconds: i64) -> Self {
        self.web_cookie_ttl = ttl_seconds;
        self
    }

    /// The `iss` of every token this service mints.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Verification key for validators running elsewhere.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        self.keys.public_key()
    }

    async fn call<T, F>(&self, operation: &'static str, future: F) -> IdentityResult<T>
    where
        F: Future<Output = IdentityResult<T>>,
    {
        with_deadline(self.storage_timeout, future)
            .await
            .map_err(|e| IdentityError::storage(operation, e))?
    }

    fn build(&self, token_type: TokenType, subject: &str, app: &App, scopes: Vec<String>, ttl: i64) -> TokenBuilder {
        TokenBuilder::new(self.issuer.clone(), token_type)
            .subject(subject)
            .audience(app.id.clone())
            .scopes(scopes)
            .ttl_seconds(ttl)
    }

    fn refresh_for(&self, user: &User, app: &App) -> IdentityResult<Token> {
        self.build(
            TokenType::Refresh,
            &user.id,
            app,
            Vec::new(),
            lifespan(app.refresh_token_lifespan, DEFAULT_REFRESH_TOKEN_LIFESPAN),
        )
        .build()
    }

    /// Mint an id (login) token.
    ///
    /// Requested scopes are narrowed to what the user may be granted and
    /// then to the app's scopes.
    ///
    /// # Errors
    ///
    /// `AppInactive`, `ScopeNotAllowed` when scopes were requested and none
    /// survive, or storage errors.
    pub async fn new_token(&self, user: &User, requested: &[String], app: &App) -> IdentityResult<Token> {
        ensure_active(app)?;
        let granted = self
            .call("request_scopes", self.user_storage.request_scopes(&user.id, requested))
            .await?;
        let scopes = intersect_scopes(&granted, &app.scopes);
        if scopes.is_empty() && !requested.is_empty() {
            return Err(IdentityError::ScopeNotAllowed);
        }

        let token = self
            .build(TokenType::Id, &user.id, app, scopes, lifespan(app.token_lifespan, DEFAULT_TOKEN_LIFESPAN))
            .payload(payload_for(user, app))
            .build()?;
        debug!(token_id = %token.id(), app_id = %app.id, user_id = %user.id, "Issued id token");
        Ok(token)
    }

    /// Mint an access token, plus a refresh token recorded in token storage
    /// when `offline` is requested and the app allows offline access.
    ///
    /// `scopes` are expected to be granted already; they are only narrowed
    /// to the app's scopes here.
    ///
    /// # Errors
    ///
    /// `AppInactive`, or storage errors while recording the refresh token.
    pub async fn new_access_token(&self, user: &User, scopes: &[String], app: &App, offline: bool) -> IdentityResult<IssuedTokens> {
        ensure_active(app)?;
        let access_token = self
            .build(
                TokenType::Access,
                &user.id,
                app,
                intersect_scopes(scopes, &app.scopes),
                lifespan(app.token_lifespan, DEFAULT_TOKEN_LIFESPAN),
            )
            .payload(payload_for(user, app))
            .build()?;

        let refresh_token = if offline && app.offline {
            let refresh = self.refresh_for(user, app)?;
            self.call("put_token", self.token_storage.put(refresh.id(), refresh.expires_at()))
                .await?;
            Some(refresh)
        } else {
            None
        };

        debug!(
            token_id = %access_token.id(),
            app_id = %app.id,
            user_id = %user.id,
            refresh = refresh_token.is_some(),
            "Issued access token"
        );
        Ok(IssuedTokens {
            access_token,
            refresh_token,
        })
    }

    /// Exchange a refresh token for a new access token and, unless the app
    /// is exempt from rotation, a new refresh token.
    ///
    /// The old refresh token is spent atomically with recording its
    /// successor. Presenting a spent token again revokes the successor.
    ///
    /// # Errors
    ///
    /// Parse and validation errors for the presented token, `TokenRevoked`,
    /// `TokenReused`, `TokenExpired`, `AppInactive`, `OfflineNotAllowed`,
    /// `UserInactive`, or storage errors.
    pub async fn renew_token(&self, raw: &str) -> IdentityResult<RenewedTokens> {
        let presented = self.parse(raw)?;
        Validator::new(self.issuer.clone(), "", TokenType::Refresh).validate(&presented)?;

        let app = self
            .call("app_by_id", self.app_storage.active_app_by_id(presented.audience()))
            .await?;
        if !app.offline {
            return Err(IdentityError::OfflineNotAllowed);
        }
        let user = self
            .call("user_by_id", self.user_storage.user_by_id(presented.subject()))
            .await?;
        if !user.active {
            return Err(IdentityError::UserInactive);
        }

        let granted = self
            .call("request_scopes", self.user_storage.request_scopes(&user.id, &[]))
            .await?;
        let access_token = self
            .build(
                TokenType::Access,
                &user.id,
                &app,
                intersect_scopes(&granted, &app.scopes),
                lifespan(app.token_lifespan, DEFAULT_TOKEN_LIFESPAN),
            )
            .payload(payload_for(&user, &app))
            .build()?;

        if app.refresh_rotation_exempt {
            if !self.call("is_valid", self.token_storage.is_valid(presented.id())).await? {
                return Err(IdentityError::TokenRevoked);
            }
            debug!(token_id = %presented.id(), app_id = %app.id, "Renewed with rotation-exempt refresh token");
            return Ok(RenewedTokens {
                access_token,
                refresh_token: presented,
            });
        }

        let successor = self.refresh_for(&user, &app)?;
        let redeemed = self
            .call(
                "redeem",
                self.token_storage.redeem(presented.id(), successor.id(), successor.expires_at()),
            )
            .await;
        match redeemed {
            Ok(()) => {}
            Err(IdentityError::TokenReused) => {
                warn!(
                    token_id = %presented.id(),
                    app_id = %app.id,
                    user_id = %user.id,
                    "Refresh token replay detected - revoking successor"
                );
                return Err(IdentityError::TokenReused);
            }
            Err(err) => return Err(err),
        }

        info!(
            token_id = %presented.id(),
            successor_id = %successor.id(),
            app_id = %app.id,
            "Rotated refresh token"
        );
        Ok(RenewedTokens {
            access_token,
            refresh_token: successor,
        })
    }

    /// Mint an invitation for `email`, optionally carrying the role the
    /// invitee will get.
    ///
    /// # Errors
    ///
    /// `AppInactive`.
    pub fn new_invite_token(&self, app: &App, email: &str, role: &str) -> IdentityResult<Token> {
        ensure_active(app)?;
        let mut payload = BTreeMap::from([("email".to_string(), serde_json::Value::from(email))]);
        if !role.is_empty() {
            payload.insert("role".to_string(), serde_json::Value::from(role));
        }
        self.build(
            TokenType::Invite,
            "",
            app,
            Vec::new(),
            lifespan(app.invite_token_lifespan, DEFAULT_INVITE_TOKEN_LIFESPAN),
        )
        .payload(payload)
        .build()
    }

    /// Mint a web session cookie token. Its audience is the issuer itself.
    ///
    /// # Errors
    ///
    /// `Internal` when the configured lifetime is not positive.
    pub fn new_web_cookie_token(&self, user: &User) -> IdentityResult<Token> {
        TokenBuilder::new(self.issuer.clone(), TokenType::WebCookie)
            .subject(user.id.clone())
            .audience(self.issuer.clone())
            .ttl_seconds(self.web_cookie_ttl)
            .build()
    }

    /// Logout cleanup: revoke the refresh record behind `raw`, even when the
    /// token has already expired. Other token types carry no record.
    ///
    /// # Errors
    ///
    /// Parse errors or storage errors.
    pub async fn invalidate_token(&self, raw: &str) -> IdentityResult<()> {
        let token = self.parse(raw)?;
        if token.token_type() != TokenType::Refresh {
            return Ok(());
        }
        self.call("invalidate", self.token_storage.invalidate(token.id())).await?;
        info!(token_id = %token.id(), app_id = %token.audience(), "Invalidated refresh token");
        Ok(())
    }

    /// Sign `token` into its compact `header.payload.signature` form.
    ///
    /// # Errors
    ///
    /// `Internal` when signing fails.
    pub fn string(&self, token: &Token) -> IdentityResult<String> {
        jsonwebtoken::encode(&Header::new(self.keys.algorithm()), token.claims(), self.keys.encoding_key())
            .map_err(|e| IdentityError::internal(format!("token encoding failed: {e}")))
    }

    /// Verify and decode a compact token. Expiry and type are not checked.
    ///
    /// # Errors
    ///
    /// `TokenMalformed` or `TokenSignatureInvalid`.
    pub fn parse(&self, raw: &str) -> IdentityResult<Token> {
        self.keys.public_key().parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningAlgorithm;
    use crate::storage::memory::{MemoryAppStorage, MemoryTokenStorage, MemoryUserStorage};
    use test_utils::fixtures::KeyPair;

    fn service(pair: KeyPair) -> TokenService {
        let keys = KeyMaterial::from_pem(pair.private_pem(), pair.public_pem(), SigningAlgorithm::Auto).unwrap();
        TokenService::new(
            keys,
            "https://id.example.com",
            Arc::new(MemoryAppStorage::new()),
            Arc::new(MemoryUserStorage::new()),
            Arc::new(MemoryTokenStorage::new()),
        )
    }

    fn app() -> App {
        App {
            id: "app-1".into(),
            active: true,
            scopes: vec!["read".into(), "write".into()],
            offline: true,
            token_payload: vec!["username".into(), "nickname".into()],
            ..App::default()
        }
    }

    fn user() -> User {
        User {
            id: "user-1".into(),
            username: "alice".into(),
            active: true,
            scopes: vec!["read".into()],
            ..User::default()
        }
    }

    #[test]
    fn test_lifespan_falls_back_to_default() {
        assert_eq!(lifespan(0, DEFAULT_TOKEN_LIFESPAN), DEFAULT_TOKEN_LIFESPAN);
        assert_eq!(lifespan(-5, DEFAULT_TOKEN_LIFESPAN), DEFAULT_TOKEN_LIFESPAN);
        assert_eq!(lifespan(9000, DEFAULT_TOKEN_LIFESPAN), 9000);
    }

    #[test]
    fn test_payload_only_carries_listed_fields() {
        let mut user = user();
        user.email = "alice@example.com".into();
        let payload = payload_for(&user, &app());
        assert_eq!(payload.len(), 1);
        assert_eq!(payload["username"], "alice");
    }

    #[test]
    fn test_string_and_parse_roundtrip_for_each_key_type() {
        for pair in [KeyPair::Rsa, KeyPair::EcP256, KeyPair::EcP384] {
            let service = service(pair);
            let token = service.new_web_cookie_token(&user()).unwrap();
            let raw = service.string(&token).unwrap();
            assert_eq!(raw.split('.').count(), 3);
            assert_eq!(service.parse(&raw).unwrap(), token);
        }
    }

    #[test]
    fn test_parse_rejects_foreign_signature() {
        let ours = service(KeyPair::Rsa);
        let theirs = service(KeyPair::RsaOther);
        let raw = theirs.string(&theirs.new_web_cookie_token(&user()).unwrap()).unwrap();
        assert!(matches!(ours.parse(&raw), Err(IdentityError::TokenSignatureInvalid)));
        assert!(matches!(ours.parse("not-a-token"), Err(IdentityError::TokenMalformed(_))));
    }

    #[test]
    fn test_web_cookie_token_targets_issuer() {
        let service = service(KeyPair::EcP256).with_web_cookie_ttl(60);
        let token = service.new_web_cookie_token(&user()).unwrap();
        assert_eq!(token.token_type(), TokenType::WebCookie);
        assert_eq!(token.audience(), service.issuer());
        assert_eq!(token.subject(), "user-1");
        assert_eq!(token.expires_at() - token.issued_at(), 60);
    }

    #[test]
    fn test_invite_token_payload() {
        let service = service(KeyPair::EcP256);
        let token = service.new_invite_token(&app(), "bob@example.com", "editor").unwrap();
        assert_eq!(token.token_type(), TokenType::Invite);
        assert_eq!(token.payload()["email"], "bob@example.com");
        assert_eq!(token.payload()["role"], "editor");
        assert_eq!(token.expires_at() - token.issued_at(), DEFAULT_INVITE_TOKEN_LIFESPAN);

        let without_role = service.new_invite_token(&app(), "bob@example.com", "").unwrap();
        assert!(!without_role.payload().contains_key("role"));
    }

    #[tokio::test]
    async fn test_inactive_app_cannot_issue() {
        let service = service(KeyPair::EcP256);
        let inactive = App {
            active: false,
            ..app()
        };
        let result = service.new_access_token(&user(), &[], &inactive, false).await;
        assert!(matches!(result, Err(IdentityError::AppInactive)));
        assert!(matches!(
            service.new_invite_token(&inactive, "bob@example.com", ""),
            Err(IdentityError::AppInactive)
        ));
    }

    #[tokio::test]
    async fn test_no_refresh_without_offline_app() {
        let service = service(KeyPair::EcP256);
        let online_only = App {
            offline: false,
            ..app()
        };
        let issued = service
            .new_access_token(&user(), &["read".into(), "admin".into()], &online_only, true)
            .await
            .unwrap();
        assert!(issued.refresh_token.is_none());
        assert_eq!(issued.access_token.scopes(), ["read".to_string()]);
    }
}
