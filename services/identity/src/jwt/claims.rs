//! Claim set carried by every minted token.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of assertion a token makes. Carried in the `type` claim and never
/// inferred from other claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenType {
    /// Proves access to an app's resources
    Access,
    /// Exchanged for new tokens
    Refresh,
    /// Login/identity token
    Id,
    /// Lets the holder register
    Invite,
    /// Short lived web session cookie
    WebCookie,
}

impl TokenType {
    /// Value of the `type` claim.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::Id => "id",
            Self::Invite => "invite",
            Self::WebCookie => "web-cookie",
        }
    }

    /// Only access and id tokens carry scopes.
    #[must_use]
    pub const fn carries_scopes(&self) -> bool {
        matches!(self, Self::Access | Self::Id)
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token content as signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Issuer
    pub iss: String,
    /// Subject, the user id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
    /// Audience, the app id
    pub aud: String,
    /// Expiry, unix seconds
    pub exp: i64,
    /// Issue time, unix seconds
    pub iat: i64,
    /// Refresh records are keyed by this id
    pub jti: String,
    /// Token type
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// Granted scopes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// User fields selected by the app
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Claims {
        Claims {
            iss: "https://id.example.com".to_string(),
            sub: String::new(),
            aud: "app-1".to_string(),
            exp: 2_000,
            iat: 1_000,
            jti: "jti-1".to_string(),
            token_type: TokenType::WebCookie,
            scopes: Vec::new(),
            payload: BTreeMap::new(),
        }
    }

    #[test]
    fn test_type_claim_names() {
        let encoded = serde_json::to_value(sample()).unwrap();
        assert_eq!(encoded["type"], "web-cookie");

        let refresh: TokenType = serde_json::from_value(json!("refresh")).unwrap();
        assert_eq!(refresh, TokenType::Refresh);
        assert!(serde_json::from_value::<TokenType>(json!("session")).is_err());
    }

    #[test]
    fn test_empty_fields_are_omitted() {
        let encoded = serde_json::to_value(sample()).unwrap();
        let object = encoded.as_object().unwrap();
        assert!(!object.contains_key("sub"));
        assert!(!object.contains_key("scopes"));
        assert!(!object.contains_key("payload"));
    }

    #[test]
    fn test_missing_type_is_rejected() {
        let raw = json!({"iss": "i", "aud": "a", "exp": 2, "iat": 1, "jti": "j"});
        assert!(serde_json::from_value::<Claims>(raw).is_err());
    }

    #[test]
    fn test_payload_is_nested() {
        let mut claims = sample();
        claims.payload.insert("email".to_string(), json!("a@example.com"));
        let encoded = serde_json::to_value(&claims).unwrap();
        assert_eq!(encoded["payload"]["email"], "a@example.com");
        assert_eq!(serde_json::from_value::<Claims>(encoded).unwrap(), claims);
    }
}
