//! Shared-token authentication for the coordinator's upgrade endpoint.

use axum::http::HeaderMap;
use rand::distr::{Alphanumeric, SampleString};

/// Header carrying the token when it is not in the query string.
pub const TOKEN_HEADER: &str = "x-auth-token";

/// Length of generated tokens.
pub const TOKEN_LENGTH: usize = 32;

/// Random alphanumeric token.
pub fn generate_token() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), TOKEN_LENGTH)
}

/// Accept the request if either the header or the query token matches.
pub fn validate(expected: &str, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    let header_ok = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| constant_time_eq(v, expected));
    header_ok || query_token.is_some_and(|t| constant_time_eq(t, expected))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
