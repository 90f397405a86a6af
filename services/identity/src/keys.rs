//! Signing key loading and algorithm selection.
//!
//! Keys are PEM encoded: PKCS#1 or PKCS#8 for RSA, PKCS#8 for elliptic
//! curve private keys, SPKI for public keys. The key type is read from the
//! algorithm identifiers inside the DER payload rather than trusted from
//! configuration.

use std::fmt;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{crypto, Algorithm, DecodingKey, EncodingKey, Validation};
use tracing::info;

use crate::error::{IdentityError, IdentityResult};
use crate::jwt::{Claims, Token};

const OID_RSA_ENCRYPTION: &[u8] = &[0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01];
const OID_EC_PUBLIC_KEY: &[u8] = &[0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];
const OID_CURVE_P256: &[u8] = &[0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
const OID_CURVE_P384: &[u8] = &[0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x22];

const PAIR_CHECK_MESSAGE: &[u8] = b"identity-key-pair-check";

/// Configured algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    /// Derive the algorithm from the private key type.
    Auto,
    /// Use this algorithm, provided the key supports it.
    Explicit(Algorithm),
}

impl SigningAlgorithm {
    /// Map a configuration name onto an algorithm.
    ///
    /// # Errors
    ///
    /// Unknown names, and symmetric or EdDSA algorithms, are configuration
    /// errors.
    pub fn from_name(name: &str) -> IdentityResult<Self> {
        let algorithm = match name.trim().to_ascii_lowercase().as_str() {
            "auto" => return Ok(Self::Auto),
            "rs256" => Algorithm::RS256,
            "rs384" => Algorithm::RS384,
            "rs512" => Algorithm::RS512,
            "ps256" => Algorithm::PS256,
            "ps384" => Algorithm::PS384,
            "ps512" => Algorithm::PS512,
            "es256" => Algorithm::ES256,
            "es384" => Algorithm::ES384,
            other => {
                return Err(IdentityError::config(format!(
                    "Unknown signing algorithm: {other}"
                )))
            }
        };
        Ok(Self::Explicit(algorithm))
    }
}

/// Key family detected from a PEM file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// RSA, any modulus size
    Rsa,
    /// NIST P-256
    EcP256,
    /// NIST P-384
    EcP384,
}

impl KeyType {
    /// Read the key type from PEM text.
    ///
    /// # Errors
    ///
    /// Returns `KeyLoad` for unparsable PEM or unsupported key types.
    pub fn detect(pem_text: &str) -> IdentityResult<Self> {
        let block = pem::parse(pem_text).map_err(|e| IdentityError::key_load(format!("invalid PEM: {e}")))?;
        let der = block.contents();

        if block.tag().starts_with("RSA ") || contains(der, OID_RSA_ENCRYPTION) {
            return Ok(Self::Rsa);
        }
        if block.tag().starts_with("EC ") || contains(der, OID_EC_PUBLIC_KEY) {
            if contains(der, OID_CURVE_P256) {
                return Ok(Self::EcP256);
            }
            if contains(der, OID_CURVE_P384) {
                return Ok(Self::EcP384);
            }
            return Err(IdentityError::key_load("unsupported elliptic curve"));
        }
        Err(IdentityError::key_load(format!(
            "unsupported key type in {} block",
            block.tag()
        )))
    }

    const fn supports(self, algorithm: Algorithm) -> bool {
        match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => matches!(self, Self::Rsa),
            Algorithm::ES256 => matches!(self, Self::EcP256),
            Algorithm::ES384 => matches!(self, Self::EcP384),
            _ => false,
        }
    }

    const fn default_algorithm(self) -> Algorithm {
        match self {
            Self::Rsa => Algorithm::RS256,
            Self::EcP256 => Algorithm::ES256,
            Self::EcP384 => Algorithm::ES384,
        }
    }

    fn encoding_key(self, pem_text: &str) -> IdentityResult<EncodingKey> {
        let result = match self {
            Self::Rsa => EncodingKey::from_rsa_pem(pem_text.as_bytes()),
            Self::EcP256 | Self::EcP384 => EncodingKey::from_ec_pem(pem_text.as_bytes()),
        };
        result.map_err(|e| IdentityError::key_load(format!("private key: {e}")))
    }

    fn decoding_key(self, pem_text: &str) -> IdentityResult<DecodingKey> {
        let result = match self {
            Self::Rsa => DecodingKey::from_rsa_pem(pem_text.as_bytes()),
            Self::EcP256 | Self::EcP384 => DecodingKey::from_ec_pem(pem_text.as_bytes()),
        };
        result.map_err(|e| IdentityError::key_load(format!("public key: {e}")))
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rsa => "RSA",
            Self::EcP256 => "EC P-256",
            Self::EcP384 => "EC P-384",
        })
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn resolve_algorithm(requested: SigningAlgorithm, key_type: KeyType) -> IdentityResult<Algorithm> {
    match requested {
        SigningAlgorithm::Auto => Ok(key_type.default_algorithm()),
        SigningAlgorithm::Explicit(algorithm) if key_type.supports(algorithm) => Ok(algorithm),
        SigningAlgorithm::Explicit(algorithm) => Err(IdentityError::AlgorithmMismatch {
            algorithm: format!("{algorithm:?}"),
            key_type: key_type.to_string(),
        }),
    }
}

/// Verification half of the key pair.
///
/// Cloneable and independent of the private key, so tokens can be parsed
/// by processes that never see the signing key.
#[derive(Clone)]
pub struct PublicKey {
    algorithm: Algorithm,
    key_type: KeyType,
    decoding: DecodingKey,
}

impl PublicKey {
    /// Load a public key for tokens signed with `algorithm`.
    ///
    /// # Errors
    ///
    /// `KeyLoad` for unreadable keys, `AlgorithmMismatch` when the key
    /// cannot verify `algorithm`.
    pub fn from_pem(pem_text: &str, algorithm: SigningAlgorithm) -> IdentityResult<Self> {
        let key_type = KeyType::detect(pem_text)?;
        let algorithm = resolve_algorithm(algorithm, key_type)?;
        Ok(Self {
            algorithm,
            key_type,
            decoding: key_type.decoding_key(pem_text)?,
        })
    }

    /// Algorithm signatures are checked with.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Key family of the public key.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Check a raw signature over `message`.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let encoded = URL_SAFE_NO_PAD.encode(signature);
        crypto::verify(&encoded, message, &self.decoding, self.algorithm).unwrap_or(false)
    }

    /// Verify a compact token and decode its claims.
    ///
    /// Expiry, audience and type are deliberately left to the validator.
    ///
    /// # Errors
    ///
    /// `TokenSignatureInvalid` when the signature or header algorithm does
    /// not match this key, `TokenMalformed` for anything structurally wrong.
    pub fn parse(&self, raw: &str) -> IdentityResult<Token> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<Claims>(raw.trim(), &self.decoding, &validation)
            .map_err(map_decode_error)?;
        Ok(Token::from_claims(data.claims))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

fn map_decode_error(err: jsonwebtoken::errors::Error) -> IdentityError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => IdentityError::TokenSignatureInvalid,
        _ => IdentityError::malformed(err),
    }
}

/// A loaded signing key pair and its algorithm. Read-only after load.
pub struct KeyMaterial {
    encoding: EncodingKey,
    public: PublicKey,
}

impl KeyMaterial {
    /// Load a key pair from PEM files.
    ///
    /// # Errors
    ///
    /// `KeyLoad` when a file is unreadable or malformed, or the keys do not
    /// form a pair. `AlgorithmMismatch` when an explicit algorithm does not
    /// fit the key type.
    pub fn from_files(
        private_key: impl AsRef<Path>,
        public_key: impl AsRef<Path>,
        algorithm: SigningAlgorithm,
    ) -> IdentityResult<Self> {
        let private_pem = read_pem(private_key.as_ref())?;
        let public_pem = read_pem(public_key.as_ref())?;
        let material = Self::from_pem(&private_pem, &public_pem, algorithm)?;

        info!(
            algorithm = ?material.algorithm(),
            key_type = %material.public.key_type,
            private_key = %private_key.as_ref().display(),
            "Loaded signing keys"
        );
        Ok(material)
    }

    /// Load a key pair from PEM text.
    ///
    /// # Errors
    ///
    /// Same as [`KeyMaterial::from_files`].
    pub fn from_pem(private_pem: &str, public_pem: &str, algorithm: SigningAlgorithm) -> IdentityResult<Self> {
        let key_type = KeyType::detect(private_pem)?;
        let public_type = KeyType::detect(public_pem)?;
        if public_type != key_type {
            return Err(IdentityError::key_load(format!(
                "public key is {public_type}, private key is {key_type}"
            )));
        }

        let algorithm = resolve_algorithm(algorithm, key_type)?;
        let material = Self {
            encoding: key_type.encoding_key(private_pem)?,
            public: PublicKey {
                algorithm,
                key_type,
                decoding: key_type.decoding_key(public_pem)?,
            },
        };

        let signature = material.sign(PAIR_CHECK_MESSAGE)?;
        if !material.verify(PAIR_CHECK_MESSAGE, &signature) {
            return Err(IdentityError::key_load("public key does not belong to private key"));
        }
        Ok(material)
    }

    /// Sign `message`, returning the raw signature bytes.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the crypto backend rejects the key.
    pub fn sign(&self, message: &[u8]) -> IdentityResult<Vec<u8>> {
        let encoded = crypto::sign(message, &self.encoding, self.public.algorithm)
            .map_err(|e| IdentityError::internal(format!("signing failed: {e}")))?;
        URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| IdentityError::internal(format!("signing failed: {e}")))
    }

    /// True when `signature` is valid for `message`.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        self.public.verify(message, signature)
    }

    /// Algorithm used for signing.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.public.algorithm
    }

    /// Verification half, safe to share.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) const fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

fn read_pem(path: &Path) -> IdentityResult<String> {
    std::fs::read_to_string(path).map_err(|e| IdentityError::key_load(format!("{}: {e}", path.display())))
}
