//! Shared test utilities for identity-platform Rust services.
//!
//! This crate provides:
//! - Signing key pairs on disk for key loading tests
//! - Proptest generators for identity domain values

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

pub use generators::*;
