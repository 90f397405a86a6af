//! Persisted records: apps, users and verification codes.

pub mod app;
pub mod user;
pub mod verification;

pub use app::{App, AppType, AppleInfo, AuthorizationWay, TfaStatus};
pub use user::{normalize_email, TfaInfo, User, UserUpdate};
pub use verification::{CodePurpose, VerificationCode};
