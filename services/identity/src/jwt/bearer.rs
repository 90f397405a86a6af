//! `Authorization` header parsing.

/// Required prefix of an `Authorization` header value, matched
/// case-insensitively. The trailing space is part of the prefix.
pub const BEARER_PREFIX: &str = "BEARER ";

/// Pull the token out of an `Authorization` header value.
///
/// Returns `None` when no bearer token is present; that is not an error.
#[must_use]
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let value = header.trim();
    if value.len() <= BEARER_PREFIX.len() {
        return None;
    }

    let prefix = value.get(..BEARER_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(BEARER_PREFIX) {
        return None;
    }
    value.get(BEARER_PREFIX.len()..)
}
