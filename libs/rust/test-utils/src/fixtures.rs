//! Signing key fixtures.
//!
//! All private keys are PKCS#8, all public keys SPKI. The RSA keys are 2048
//! bit; `rsa_other` is an unrelated pair used to provoke signature and
//! pairing failures.

use std::path::PathBuf;

/// A private/public PEM file pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPair {
    /// RSA 2048
    Rsa,
    /// A second, unrelated RSA 2048 pair
    RsaOther,
    /// ECDSA over P-256
    EcP256,
    /// ECDSA over P-384
    EcP384,
}

impl KeyPair {
    const fn stem(self) -> &'static str {
        match self {
            Self::Rsa => "rsa",
            Self::RsaOther => "rsa_other",
            Self::EcP256 => "ec",
            Self::EcP384 => "ec384",
        }
    }

    /// Path of the private key file.
    #[must_use]
    pub fn private_path(self) -> PathBuf {
        keys_dir().join(format!("{}_private.pem", self.stem()))
    }

    /// Path of the public key file.
    #[must_use]
    pub fn public_path(self) -> PathBuf {
        keys_dir().join(format!("{}_public.pem", self.stem()))
    }

    /// Private key PEM text.
    #[must_use]
    pub const fn private_pem(self) -> &'static str {
        match self {
            Self::Rsa => include_str!("../keys/rsa_private.pem"),
            Self::RsaOther => include_str!("../keys/rsa_other_private.pem"),
            Self::EcP256 => include_str!("../keys/ec_private.pem"),
            Self::EcP384 => include_str!("../keys/ec384_private.pem"),
        }
    }

    /// Public key PEM text.
    #[must_use]
    pub const fn public_pem(self) -> &'static str {
        match self {
            Self::Rsa => include_str!("../keys/rsa_public.pem"),
            Self::RsaOther => include_str!("../keys/rsa_other_public.pem"),
            Self::EcP256 => include_str!("../keys/ec_public.pem"),
            Self::EcP384 => include_str!("../keys/ec384_public.pem"),
        }
    }
}

/// Directory holding the key files.
#[must_use]
pub fn keys_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("keys")
}
