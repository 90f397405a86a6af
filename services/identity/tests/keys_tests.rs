//! Key loading from PEM files on disk.

use identity_service::keys::{KeyMaterial, KeyType, PublicKey, SigningAlgorithm};
use identity_service::IdentityError;
use jsonwebtoken::Algorithm;
use test_utils::fixtures::KeyPair;

#[test]
fn test_loads_every_fixture_pair() {
    let expected = [
        (KeyPair::Rsa, KeyType::Rsa, Algorithm::RS256),
        (KeyPair::RsaOther, KeyType::Rsa, Algorithm::RS256),
        (KeyPair::EcP256, KeyType::EcP256, Algorithm::ES256),
        (KeyPair::EcP384, KeyType::EcP384, Algorithm::ES384),
    ];
    for (pair, key_type, algorithm) in expected {
        let keys = KeyMaterial::from_files(pair.private_path(), pair.public_path(), SigningAlgorithm::Auto).unwrap();
        assert_eq!(keys.algorithm(), algorithm, "{pair:?}");
        assert_eq!(keys.public_key().key_type(), key_type, "{pair:?}");
    }
}

#[test]
fn test_name_table_drives_explicit_selection() {
    let algorithm = SigningAlgorithm::from_name("PS256").unwrap();
    let keys = KeyMaterial::from_files(KeyPair::Rsa.private_path(), KeyPair::Rsa.public_path(), algorithm).unwrap();
    assert_eq!(keys.algorithm(), Algorithm::PS256);

    let signature = keys.sign(b"hello").unwrap();
    let public = PublicKey::from_pem(KeyPair::Rsa.public_pem(), algorithm).unwrap();
    assert!(public.verify(b"hello", &signature));
}

#[test]
fn test_swapped_files_fail_to_load() {
    let result = KeyMaterial::from_files(
        KeyPair::EcP256.public_path(),
        KeyPair::EcP256.private_path(),
        SigningAlgorithm::Auto,
    );
    assert!(matches!(result, Err(IdentityError::KeyLoad(_))));
}

#[test]
fn test_public_key_must_fit_explicit_algorithm() {
    let result = PublicKey::from_pem(KeyPair::EcP256.public_pem(), SigningAlgorithm::Explicit(Algorithm::RS256));
    assert!(matches!(result, Err(IdentityError::AlgorithmMismatch { .. })));
}
