//! Property-based tests for token framing, scopes and validation.
//!
//! Property 1: String/Parse round trip
//! Property 2: Verification needs only the public key
//! Property 3: Scope narrowing never widens
//! Property 4: Expiry is independent of signature validity
//! Property 5: Bearer extraction

use std::collections::BTreeMap;
use std::sync::Arc;

use identity_service::jwt::TokenBuilder;
use identity_service::keys::{KeyMaterial, PublicKey, SigningAlgorithm};
use identity_service::storage::memory::{MemoryAppStorage, MemoryTokenStorage, MemoryUserStorage};
use identity_service::storage::{grant_scopes, intersect_scopes};
use identity_service::{extract_bearer_token, IdentityError, TokenService, TokenType, Validator};
use proptest::prelude::*;
use test_utils::fixtures::KeyPair;
use test_utils::{id_strategy, issuer_strategy, payload_strategy, scopes_strategy, ttl_strategy};

fn service(issuer: &str) -> TokenService {
    let keys =
        KeyMaterial::from_pem(KeyPair::EcP256.private_pem(), KeyPair::EcP256.public_pem(), SigningAlgorithm::Auto)
            .unwrap();
    TokenService::new(
        keys,
        issuer,
        Arc::new(MemoryAppStorage::new()),
        Arc::new(MemoryUserStorage::new()),
        Arc::new(MemoryTokenStorage::new()),
    )
}

fn arb_token_type() -> impl Strategy<Value = TokenType> {
    prop_oneof![
        Just(TokenType::Access),
        Just(TokenType::Refresh),
        Just(TokenType::Id),
        Just(TokenType::Invite),
        Just(TokenType::WebCookie),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property 1: String/Parse round trip
    ///
    /// Parsing the compact form of an issued token yields the same claims.
    #[test]
    fn prop_string_parse_roundtrip(
        issuer in issuer_strategy(),
        subject in id_strategy(),
        audience in id_strategy(),
        token_type in arb_token_type(),
        scopes in scopes_strategy(5),
        ttl in ttl_strategy(),
        payload in payload_strategy(),
    ) {
        let service = service(&issuer);
        let payload: BTreeMap<String, serde_json::Value> =
            payload.into_iter().map(|(k, v)| (k, serde_json::Value::from(v))).collect();
        let token = TokenBuilder::new(issuer.clone(), token_type)
            .subject(subject)
            .audience(audience)
            .scopes(scopes)
            .payload(payload)
            .ttl_seconds(ttl)
            .build()
            .unwrap();

        let raw = service.string(&token).unwrap();
        prop_assert_eq!(raw.split('.').count(), 3);
        let parsed = service.parse(&raw).unwrap();
        prop_assert_eq!(parsed, token);
    }

    /// Property 2: Verification needs only the public key
    #[test]
    fn prop_public_key_alone_verifies(issuer in issuer_strategy(), subject in id_strategy()) {
        let service = service(&issuer);
        let token = TokenBuilder::new(issuer.clone(), TokenType::Access)
            .subject(subject)
            .ttl_seconds(60)
            .build()
            .unwrap();
        let raw = service.string(&token).unwrap();

        let public = PublicKey::from_pem(KeyPair::EcP256.public_pem(), SigningAlgorithm::Auto).unwrap();
        let parsed = public.parse(&raw).unwrap();
        prop_assert!(Validator::new(issuer, "", TokenType::Access).validate(&parsed).is_ok());

        let foreign = PublicKey::from_pem(KeyPair::EcP384.public_pem(), SigningAlgorithm::Auto).unwrap();
        prop_assert!(foreign.parse(&raw).is_err());
    }

    /// Property 3: Scope narrowing never widens
    ///
    /// Granted scopes are requested, permitted for the user and allowed for
    /// the app. An empty request grants everything permitted.
    #[test]
    fn prop_scope_narrowing(
        requested in scopes_strategy(6),
        permitted in scopes_strategy(6),
        app_scopes in scopes_strategy(6),
    ) {
        match grant_scopes(&permitted, &requested) {
            Ok(granted) => {
                let narrowed = intersect_scopes(&granted, &app_scopes);
                for scope in &narrowed {
                    prop_assert!(permitted.contains(scope));
                    prop_assert!(app_scopes.contains(scope));
                    prop_assert!(requested.is_empty() || requested.contains(scope));
                }
                if requested.is_empty() {
                    prop_assert_eq!(granted, permitted);
                }
            }
            Err(err) => {
                prop_assert!(matches!(err, IdentityError::ScopeNotAllowed));
                prop_assert!(!requested.is_empty());
                prop_assert!(requested.iter().all(|scope| !permitted.contains(scope)));
            }
        }
    }

    /// Property 4: Expiry is independent of signature validity
    #[test]
    fn prop_expired_tokens_fail_validation(ttl in ttl_strategy(), late_by in 0i64..1_000_000) {
        let service = service("https://id.example.com");
        let token = TokenBuilder::new("https://id.example.com", TokenType::Access)
            .ttl_seconds(ttl)
            .build()
            .unwrap();
        let parsed = service.parse(&service.string(&token).unwrap()).unwrap();
        let validator = Validator::new("https://id.example.com", "", TokenType::Access);

        prop_assert!(validator.validate_at(&parsed, parsed.expires_at() - 1).is_ok());
        prop_assert!(matches!(
            validator.validate_at(&parsed, parsed.expires_at() + late_by),
            Err(IdentityError::TokenExpired)
        ));
    }

    /// Property 5: Bearer extraction
    #[test]
    fn prop_bearer_extraction(
        token in "[A-Za-z0-9_.-]{1,64}",
        prefix in prop_oneof![Just("Bearer "), Just("BEARER "), Just("bearer "), Just("bEaReR ")],
        padding in "[ \t]{0,3}",
    ) {
        let header = format!("{padding}{prefix}{token}{padding}");
        prop_assert_eq!(extract_bearer_token(&header), Some(token.as_str()));
        let basic = format!("Basic {token}");
        prop_assert_eq!(extract_bearer_token(&basic), None);
    }
}
