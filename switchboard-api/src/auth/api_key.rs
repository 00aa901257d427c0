//! API-key authentication: configured headers inspected in order, values
//! compared in constant time by comparing digests rather than the strings
//! themselves.

use axum::http::HeaderMap;
use sha1::{Digest, Sha1};

/// Timing-safe equality: comparing fixed-length digests leaks nothing about
/// where two unequal keys diverge.
fn digest_eq(a: &str, b: &str) -> bool {
    Sha1::digest(a.as_bytes()) == Sha1::digest(b.as_bytes())
}

pub struct ApiKeyValidator {
    keys: Vec<String>,
    headers: Vec<String>,
}

impl ApiKeyValidator {
    pub fn new(keys: &[String], headers: &[String]) -> Self {
        Self {
            keys: keys.to_vec(),
            headers: headers.to_vec(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Whether any configured header carries a valid key. `None` when no
    /// configured header is present at all (so hybrid mode can fall
    /// through), `Some(false)` when a key was presented but is wrong.
    pub fn check(&self, headers: &HeaderMap) -> Option<bool> {
        let mut presented = None;
        for header in &self.headers {
            if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
                presented = Some(value);
                break;
            }
        }
        let presented = presented?;
        Some(self.keys.iter().any(|key| digest_eq(key, presented)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn validator() -> ApiKeyValidator {
        ApiKeyValidator::new(
            &["k-alpha".to_string(), "k-beta".to_string()],
            &["x-api-key".to_string(), "x-token".to_string()],
        )
    }

    #[test]
    fn accepts_any_configured_key_on_any_configured_header() {
        let validator = validator();

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k-alpha"));
        assert_eq!(validator.check(&headers), Some(true));

        let mut headers = HeaderMap::new();
        headers.insert("x-token", HeaderValue::from_static("k-beta"));
        assert_eq!(validator.check(&headers), Some(true));
    }

    #[test]
    fn wrong_key_is_a_presented_failure_not_a_miss() {
        let validator = validator();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k-wrong"));
        assert_eq!(validator.check(&headers), Some(false));
    }

    #[test]
    fn absent_headers_are_a_miss() {
        let validator = validator();
        let headers = HeaderMap::new();
        assert_eq!(validator.check(&headers), None);
    }

    #[test]
    fn digest_comparison_agrees_with_string_equality() {
        assert!(digest_eq("secret", "secret"));
        assert!(!digest_eq("secret", "secret2"));
        assert!(!digest_eq("", "secret"));
    }
}
