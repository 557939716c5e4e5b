//! Claim peeking for the compact dot-delimited credential the platform
//! stores in its auth cookies.
//!
//! Decoding here is advisory: the middle segment is read for routing
//! decisions only and the signature segment is never checked (verification
//! belongs to the backend that issued the credential). The decoder is
//! total — any malformed input yields `None`, never an error — so a bad
//! cookie degrades to "no roles" and the gate fails toward stricter gating.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::policy::Role;

/// Claim set read from the middle segment of a compact credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl TokenPayload {
    /// Raw role claims: the `roles` array when present, else the single
    /// `role` value, else nothing.
    pub fn role_claims(&self) -> Vec<String> {
        if let Some(roles) = &self.roles {
            return roles.clone();
        }
        if let Some(role) = &self.role {
            return vec![role.clone()];
        }
        Vec::new()
    }
}

/// Extract the claim set from a compact credential without verifying it.
/// Returns `None` on any malformation: missing middle segment, bad
/// base64url, bytes that are not JSON, or JSON that is not an object.
pub fn decode_unverified(token: &str) -> Option<TokenPayload> {
    let parts: Vec<&str> = token.split('.').collect();
    let middle = parts.get(1)?;
    let bytes = decode_base64url(middle)?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let map = value.as_object()?;

    let mut payload = TokenPayload::default();
    payload.sub = map.get("sub").and_then(|v| v.as_str()).map(|s| s.to_string());
    payload.exp = map.get("exp").and_then(|v| v.as_i64());
    payload.iat = map.get("iat").and_then(|v| v.as_i64());
    payload.roles = map.get("roles").and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect()
    });
    payload.role = map.get("role").and_then(|v| v.as_str()).map(|s| s.to_string());
    Some(payload)
}

/// Base64url decode tolerating both padded and unpadded segments.
fn decode_base64url(segment: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()
}

/// Mint the compact three-segment form for local logins and tests. The
/// third segment is opaque random bytes, not a signature; nothing in this
/// crate ever reads it.
pub fn encode_claims(sub: &str, roles: &[Role], exp: Option<i64>) -> String {
    let header = serde_json::json!({"alg": "none", "typ": "JWT"});
    let payload = serde_json::json!({
        "sub": sub,
        "iat": chrono::Utc::now().timestamp(),
        "exp": exp,
        "roles": roles.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
    });
    let mut tail = [0u8; 32];
    let _ = getrandom::getrandom(&mut tail);
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string()),
        URL_SAFE_NO_PAD.encode(tail)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_payload(json: &str) -> String {
        format!("hdr.{}.sig", URL_SAFE_NO_PAD.encode(json))
    }

    #[test]
    fn decodes_roles_array() {
        let tok = token_with_payload(r#"{"sub":"u1","roles":["staff","admin"]}"#);
        let payload = decode_unverified(&tok).unwrap();
        assert_eq!(payload.sub.as_deref(), Some("u1"));
        assert_eq!(payload.role_claims(), vec!["staff".to_string(), "admin".to_string()]);
    }

    #[test]
    fn falls_back_to_single_role_claim() {
        let tok = token_with_payload(r#"{"role":"customer"}"#);
        let payload = decode_unverified(&tok).unwrap();
        assert_eq!(payload.role_claims(), vec!["customer".to_string()]);
    }

    #[test]
    fn roles_array_wins_over_single_role() {
        let tok = token_with_payload(r#"{"roles":["staff"],"role":"admin"}"#);
        let payload = decode_unverified(&tok).unwrap();
        assert_eq!(payload.role_claims(), vec!["staff".to_string()]);
    }

    #[test]
    fn non_string_entries_are_skipped() {
        let tok = token_with_payload(r#"{"roles":["staff",42,null,{"x":1}]}"#);
        let payload = decode_unverified(&tok).unwrap();
        assert_eq!(payload.role_claims(), vec!["staff".to_string()]);
    }

    #[test]
    fn malformed_inputs_yield_none() {
        assert_eq!(decode_unverified(""), None);
        assert_eq!(decode_unverified("no-dots-here"), None);
        assert_eq!(decode_unverified("a.!!!not-base64!!!.c"), None);
        // valid base64 but not JSON
        let not_json = format!("a.{}.c", URL_SAFE_NO_PAD.encode("hello"));
        assert_eq!(decode_unverified(&not_json), None);
        // valid JSON but not an object
        let not_object = format!("a.{}.c", URL_SAFE_NO_PAD.encode("[1,2,3]"));
        assert_eq!(decode_unverified(&not_object), None);
    }

    #[test]
    fn tolerates_padded_segments() {
        use base64::engine::general_purpose::URL_SAFE;
        let padded = format!("a.{}.c", URL_SAFE.encode(r#"{"role":"staff"}"#));
        let payload = decode_unverified(&padded).unwrap();
        assert_eq!(payload.role_claims(), vec!["staff".to_string()]);
    }

    #[test]
    fn minted_token_round_trips() {
        let tok = encode_claims("traveler7", &[Role::Customer, Role::Staff], Some(2_000_000_000));
        let payload = decode_unverified(&tok).unwrap();
        assert_eq!(payload.sub.as_deref(), Some("traveler7"));
        assert_eq!(payload.exp, Some(2_000_000_000));
        assert_eq!(payload.role_claims(), vec!["customer".to_string(), "staff".to_string()]);
    }

    #[test]
    fn missing_claims_mean_no_roles() {
        let tok = token_with_payload(r#"{"sub":"u2"}"#);
        let payload = decode_unverified(&tok).unwrap();
        assert!(payload.role_claims().is_empty());
    }
}
