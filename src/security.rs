//! Extraction and constant-time validation of the shared proxy access token,
//! grounded on the `subtle::ConstantTimeEq`-based comparator pattern found in
//! the retrieval pack's `fraiseql-server` auth module.

use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;

use axum::http::{HeaderMap, Uri};

/// `{ enabled, token }`. If `enabled` and no token was configured, one is
/// generated at start and exposed once via [`SecurityGate::secure_key`].
#[derive(Clone)]
pub struct SecurityGate {
    enabled: bool,
    token: Option<String>,
}

impl SecurityGate {
    pub fn new(require_secure_key: bool, configured_token: Option<String>) -> Self {
        if !require_secure_key {
            return Self { enabled: false, token: None };
        }
        let token = configured_token.unwrap_or_else(generate_token);
        Self { enabled: true, token: Some(token) }
    }

    pub fn secure_key(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Extracts a candidate token from, in priority order: the
    /// `X-API-Buddy-Key` header, an `Authorization: Bearer …` header, the
    /// `key` query parameter, or the first path segment (only considered when
    /// security is enabled).
    pub fn extract_candidate(headers: &HeaderMap, uri: &Uri, first_path_segment: &str) -> Option<String> {
        if let Some(value) = headers.get("X-API-Buddy-Key").and_then(|v| v.to_str().ok()) {
            return Some(value.to_string());
        }
        if let Some(value) = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            return Some(value.to_string());
        }
        if let Some(query) = uri.query() {
            for pair in query.split('&') {
                if let Some(value) = pair.strip_prefix("key=") {
                    return Some(value.to_string());
                }
            }
        }
        if !first_path_segment.is_empty() {
            return Some(first_path_segment.to_string());
        }
        None
    }

    /// Constant-time validation against the configured token.
    pub fn validate(&self, candidate: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(token) = &self.token else { return false };
        match candidate {
            Some(candidate) => token.as_bytes().ct_eq(candidate.as_bytes()).into(),
            None => false,
        }
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_gate_always_admits() {
        let gate = SecurityGate::new(false, None);
        assert!(gate.validate(None));
        assert!(gate.validate(Some("anything")));
    }

    #[test]
    fn enabled_gate_rejects_missing_token() {
        let gate = SecurityGate::new(true, Some("secret".to_string()));
        assert!(!gate.validate(None));
    }

    #[test]
    fn enabled_gate_rejects_wrong_token() {
        let gate = SecurityGate::new(true, Some("secret".to_string()));
        assert!(!gate.validate(Some("wrong")));
    }

    #[test]
    fn enabled_gate_accepts_correct_token() {
        let gate = SecurityGate::new(true, Some("secret".to_string()));
        assert!(gate.validate(Some("secret")));
    }

    #[test]
    fn generated_token_has_sufficient_entropy() {
        let gate = SecurityGate::new(true, None);
        let key = gate.secure_key().expect("token generated");
        // 16 raw bytes = 128 bits, base64url without padding is at least 22 chars.
        assert!(key.len() >= 22);
    }
}
