//! Proptest generators for identity domain values.

use proptest::collection::{btree_set, vec};
use proptest::prelude::*;

/// A single scope name such as `read` or `profile:write`.
pub fn scope_strategy() -> impl Strategy<Value = String> {
    "[a-z]{2,8}(:[a-z]{2,6})?"
}

/// A duplicate-free list of scopes, possibly empty.
pub fn scopes_strategy(max: usize) -> impl Strategy<Value = Vec<String>> {
    btree_set(scope_strategy(), 0..=max).prop_map(|set| set.into_iter().collect())
}

/// Opaque identifiers in the shape the services assign.
pub fn id_strategy() -> impl Strategy<Value = String> {
    "[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}"
}

/// Login names.
pub fn username_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_.]{2,15}"
}

/// Email addresses, deliberately mixed case.
pub fn email_strategy() -> impl Strategy<Value = String> {
    ("[a-zA-Z][a-zA-Z0-9.]{1,12}", "[a-z]{3,10}", prop_oneof![Just("com"), Just("org"), Just("io")])
        .prop_map(|(local, domain, tld)| format!("{local}@{domain}.{tld}"))
}

/// Issuer URLs.
pub fn issuer_strategy() -> impl Strategy<Value = String> {
    "[a-z]{3,12}".prop_map(|host| format!("https://{host}.example.com"))
}

/// Token lifetimes in seconds, from one second to roughly a year.
pub fn ttl_strategy() -> impl Strategy<Value = i64> {
    1i64..=31_536_000
}

/// Small string payload maps.
pub fn payload_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    vec(("[a-z_]{1,10}", "[ -~]{0,24}"), 0..4)
}
