//! Token claims, builders, parsed tokens and bearer header parsing.

pub mod bearer;
pub mod builder;
pub mod claims;
pub mod token;

pub use bearer::extract_bearer_token;
pub use builder::TokenBuilder;
pub use claims::{Claims, TokenType};
pub use token::Token;
