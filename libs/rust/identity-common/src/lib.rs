//! Shared cross-cutting helpers for identity-platform Rust services.
//!
//! This crate provides:
//! - Retry policies with exponential backoff over any [`Retryable`] error
//! - Deadlines for calls into slow or hung collaborators
//! - Tracing subscriber setup for binaries

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod deadline;
pub mod retry;
pub mod tracing_config;

pub use deadline::{with_deadline, DeadlineExceeded};
pub use retry::{RetryConfig, RetryPolicy, Retryable};
pub use tracing_config::{init_tracing, TracingConfig};
