//! C10: `AuthGuard` — a single shared bearer key checked across all three
//! protocol surfaces (`spec.md` §4.8 "AuthGuard").
//!
//! Grounded on the donor's `MemoryAuth`/`extract_api_key` (`gproxy-core/src/auth.rs`),
//! generalized to also accept `x-goog-api-key` (the donor only checks
//! `x-api-key` and `Authorization: Bearer`, which is insufficient for the
//! Gemini-native surface) and to render a protocol-shaped 401 body instead of
//! a single generic one.
use http::HeaderMap;

use crate::error::ProxyError;

/// Which wire protocol a request arrived on, so a 401 can be rendered in
/// that protocol's own error shape (`spec.md` §4.8 "Unauthorized response").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProtocol {
    OpenAi,
    Anthropic,
    Gemini,
}

#[derive(Debug, Clone)]
pub struct AuthGuard {
    /// Empty string disables the guard entirely (`spec.md` §4.8 "no key configured").
    api_key: String,
}

impl AuthGuard {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }

    pub fn reload(&mut self, api_key: String) {
        self.api_key = api_key;
    }

    /// `spec.md` §4.8: when no key is configured every request passes.
    /// Otherwise the incoming key must equal the configured one exactly.
    pub fn authenticate(&self, headers: &HeaderMap, protocol: ClientProtocol) -> Result<(), ProxyError> {
        if self.api_key.is_empty() {
            return Ok(());
        }

        match extract_api_key(headers) {
            Some(key) if key == self.api_key => Ok(()),
            _ => Err(unauthorized_body(protocol)),
        }
    }
}

/// Checks, in order: `Authorization: Bearer <key>`, `x-api-key`,
/// `x-goog-api-key`. A header repeated across multiple values yields the
/// first non-empty trimmed one (`spec.md` §4.8 "Header extraction").
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = first_non_empty(headers, "authorization") {
        let trimmed = auth.trim();
        if let Some(token) = trimmed
            .strip_prefix("Bearer ")
            .or_else(|| trimmed.strip_prefix("bearer "))
        {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    if let Some(key) = first_non_empty(headers, "x-api-key") {
        return Some(key);
    }

    first_non_empty(headers, "x-goog-api-key")
}

fn first_non_empty(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn unauthorized_body(protocol: ClientProtocol) -> ProxyError {
    let body = match protocol {
        ClientProtocol::OpenAi => serde_json::json!({
            "error": {
                "message": "Incorrect API key provided.",
                "type": "invalid_request_error",
                "param": serde_json::Value::Null,
                "code": "invalid_api_key",
            }
        }),
        ClientProtocol::Anthropic => serde_json::json!({
            "type": "error",
            "error": {
                "type": "api_error",
                "message": "Invalid API key.",
            }
        }),
        ClientProtocol::Gemini => serde_json::json!({
            "error": {
                "code": 401,
                "message": "API key not valid. Please pass a valid API key.",
                "status": "UNAUTHENTICATED",
            }
        }),
    };
    ProxyError::unauthorized(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        headers
    }

    #[test]
    fn empty_configured_key_bypasses_everything() {
        let guard = AuthGuard::new(String::new());
        let headers = HeaderMap::new();
        assert!(guard.authenticate(&headers, ClientProtocol::OpenAi).is_ok());
    }

    #[test]
    fn accepts_bearer_authorization() {
        let guard = AuthGuard::new("secret".to_string());
        let headers = headers_with(&[("authorization", "Bearer secret")]);
        assert!(guard.authenticate(&headers, ClientProtocol::OpenAi).is_ok());
    }

    #[test]
    fn accepts_x_api_key() {
        let guard = AuthGuard::new("secret".to_string());
        let headers = headers_with(&[("x-api-key", "secret")]);
        assert!(guard.authenticate(&headers, ClientProtocol::Anthropic).is_ok());
    }

    #[test]
    fn accepts_x_goog_api_key() {
        let guard = AuthGuard::new("secret".to_string());
        let headers = headers_with(&[("x-goog-api-key", "secret")]);
        assert!(guard.authenticate(&headers, ClientProtocol::Gemini).is_ok());
    }

    #[test]
    fn rejects_wrong_key_with_protocol_shaped_body() {
        let guard = AuthGuard::new("secret".to_string());
        let headers = headers_with(&[("x-api-key", "wrong")]);
        let err = guard
            .authenticate(&headers, ClientProtocol::Anthropic)
            .unwrap_err();
        assert_eq!(err.status, 401);
        let body: serde_json::Value = serde_json::from_slice(&err.body).unwrap();
        assert_eq!(body["type"], "error");
    }

    #[test]
    fn rejects_missing_key() {
        let guard = AuthGuard::new("secret".to_string());
        let headers = HeaderMap::new();
        assert!(guard.authenticate(&headers, ClientProtocol::OpenAi).is_err());
    }
}
