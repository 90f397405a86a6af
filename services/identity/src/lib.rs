//! Identity service library.
//!
//! Signing key loading, token minting and parsing, refresh token rotation,
//! and app/user/token/verification-code storage on pluggable backends.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod composer;
pub mod config;
pub mod error;
pub mod jwt;
pub mod keys;
pub mod model;
pub mod service;
pub mod storage;
pub mod validator;

// Re-exports for convenience
pub use composer::{Backend, ComposerState, Composition, DatabaseComposer, PartialComposer};
pub use config::{DatabaseSettings, DatabaseType, KeySettings, ServerSettings, StorageSettings};
pub use error::{IdentityError, IdentityResult};
pub use jwt::{extract_bearer_token, Claims, Token, TokenType};
pub use keys::{KeyMaterial, PublicKey, SigningAlgorithm};
pub use service::{IssuedTokens, RenewedTokens, TokenService};
pub use validator::Validator;
