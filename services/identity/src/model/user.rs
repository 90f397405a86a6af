//! User accounts and partial updates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Two-factor authentication state of a user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TfaInfo {
    /// TFA is set up
    pub enabled: bool,
    /// Shared TOTP secret
    pub secret: String,
}

/// A user account.
///
/// Username and email are unique among users when non-empty. Emails are
/// stored normalized, see [`normalize_email`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    /// Stable unique id
    pub id: String,
    /// Login name, empty for anonymous users
    pub username: String,
    /// Normalized email, may be empty
    pub email: String,
    /// Argon2 PHC string
    pub password_hash: String,
    /// Inactive users cannot renew tokens
    pub active: bool,
    /// Registered without credentials
    pub anonymous: bool,
    /// Assigned roles
    pub roles: Vec<String>,
    /// Scopes this user may be granted
    pub scopes: Vec<String>,
    /// Two-factor state
    pub tfa: TfaInfo,
    /// Free-form public attributes
    pub profile: BTreeMap<String, Value>,
}

impl User {
    /// Copy safe to hand to clients.
    #[must_use]
    pub fn sanitized(&self) -> Self {
        let mut user = self.clone();
        user.password_hash.clear();
        user.tfa.secret.clear();
        user
    }

    /// Value of a field that may appear in a token payload.
    ///
    /// Secrets are never reachable from here.
    #[must_use]
    pub fn payload_field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::from(self.id.clone())),
            "username" => Some(Value::from(self.username.clone())),
            "email" => Some(Value::from(self.email.clone())),
            "roles" => Some(Value::from(self.roles.clone())),
            "anonymous" => Some(Value::from(self.anonymous)),
            other => self.profile.get(other).cloned(),
        }
    }
}

/// Partial user update. `None` leaves the field untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserUpdate {
    /// New username; clears the anonymous flag
    pub username: Option<String>,
    /// New email, normalized on apply
    pub email: Option<String>,
    /// Enable or disable
    pub active: Option<bool>,
    /// Replacement roles
    pub roles: Option<Vec<String>>,
    /// Replacement permitted scopes
    pub scopes: Option<Vec<String>>,
    /// Replacement TFA state
    pub tfa: Option<TfaInfo>,
    /// Replacement profile
    pub profile: Option<BTreeMap<String, Value>>,
}

impl UserUpdate {
    /// Apply to `user`. Setting a username turns an anonymous user into a
    /// regular one.
    pub fn apply(self, user: &mut User) {
        if let Some(username) = self.username {
            user.username = username;
            user.anonymous = false;
        }
        if let Some(email) = self.email {
            user.email = normalize_email(&email);
        }
        if let Some(active) = self.active {
            user.active = active;
        }
        if let Some(roles) = self.roles {
            user.roles = roles;
        }
        if let Some(scopes) = self.scopes {
            user.scopes = scopes;
        }
        if let Some(tfa) = self.tfa {
            user.tfa = tfa;
        }
        if let Some(profile) = self.profile {
            user.profile = profile;
        }
    }
}

/// Trimmed and lowercased email, the form emails are stored and looked up in.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> User {
        User {
            id: "u1".to_string(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "$argon2id$...".to_string(),
            roles: vec!["admin".to_string()],
            tfa: TfaInfo {
                enabled: true,
                secret: "totp".to_string(),
            },
            profile: BTreeMap::from([("locale".to_string(), json!("de"))]),
            ..User::default()
        }
    }

    #[test]
    fn test_sanitized_strips_secrets() {
        let clean = user().sanitized();
        assert!(clean.password_hash.is_empty());
        assert!(clean.tfa.secret.is_empty());
        assert!(clean.tfa.enabled);
    }

    #[test]
    fn test_payload_fields() {
        let user = user();
        assert_eq!(user.payload_field("email"), Some(json!("alice@example.com")));
        assert_eq!(user.payload_field("roles"), Some(json!(["admin"])));
        assert_eq!(user.payload_field("locale"), Some(json!("de")));
        assert_eq!(user.payload_field("password_hash"), None);
        assert_eq!(user.payload_field("missing"), None);
    }

    #[test]
    fn test_update_deanonymizes_on_username() {
        let mut user = User {
            anonymous: true,
            ..user()
        };
        UserUpdate {
            email: Some(" Alice@Example.COM ".to_string()),
            ..UserUpdate::default()
        }
        .apply(&mut user);
        assert!(user.anonymous);
        assert_eq!(user.email, "alice@example.com");

        UserUpdate {
            username: Some("alice2".to_string()),
            ..UserUpdate::default()
        }
        .apply(&mut user);
        assert!(!user.anonymous);
        assert_eq!(user.username, "alice2");
    }
}
