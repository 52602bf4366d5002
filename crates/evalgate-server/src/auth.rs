//! Shared-secret authentication.

use std::fmt;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

/// The shared secret callers must present.
///
/// Loaded once at startup and never mutated. `Debug` does not print it.
#[derive(Clone)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a secret. Returns `None` for empty values and for values
    /// containing whitespace, which could never equal a single header token.
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        if secret.is_empty() || secret.chars().any(char::is_whitespace) {
            None
        } else {
            Some(Self(secret))
        }
    }

    /// Whether the request carries this secret as the last token of its
    /// `Authorization` header.
    ///
    /// Header values that are not visible ASCII count as missing.
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        match presented_token(value) {
            Some(token) => token.as_bytes().ct_eq(self.0.as_bytes()).into(),
            None => false,
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// The last whitespace-delimited token of a header value.
fn presented_token(value: &str) -> Option<&str> {
    value.split_whitespace().last()
}
