//! Webhook-standard signature verification (spec §4.9).
//!
//! Grounded: `original_source/backend/core/composio_integration/api.py`'s
//! `verify_std_webhook`/`verify_composio` — tries a small matrix of key
//! encodings, field orderings, and signature formats rather than assuming
//! one, since upstream senders are not uniform. Timestamp skew and
//! signature bytes are both compared in constant time.

use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::SecretString;

type HmacSha256 = Hmac<Sha256>;

/// Encodings the signing key might be stored/transmitted in.
fn key_variants(secret: &str) -> Vec<Vec<u8>> {
    let mut variants = vec![secret.as_bytes().to_vec()];
    if let Ok(hex) = hex_decode(secret) {
        variants.push(hex);
    }
    if let Ok(b64) = base64::engine::general_purpose::STANDARD.decode(secret) {
        variants.push(b64);
    }
    variants
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

/// Signature strings come either hex- or base64-encoded, sometimes with a
/// `sha256=` / `v1=` style prefix.
fn decode_signature(signature: &str) -> Vec<Vec<u8>> {
    let stripped = signature
        .split_once('=')
        .map(|(_, rest)| rest)
        .unwrap_or(signature);
    let mut out = Vec::new();
    if let Ok(hex) = hex_decode(stripped) {
        out.push(hex);
    }
    if let Ok(b64) = base64::engine::general_purpose::STANDARD.decode(stripped) {
        out.push(b64);
    }
    out
}

fn mac_for(key: &[u8], message: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(message);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Verifies `signature` against `id.ts.body` (and the looser `ts.body`
/// fallback some senders use), across every key/signature encoding in the
/// matrix, and checks `ts` falls within `skew_secs` of now.
///
/// Returns `Ok(())` on a verified match, `Err(reason)` otherwise. Never
/// panics on malformed input; malformed input is just a verification
/// failure.
pub fn verify_webhook_signature(
    secret: &SecretString,
    webhook_id: &str,
    timestamp: &str,
    raw_body: &[u8],
    signature: &str,
    skew_secs: i64,
) -> Result<(), String> {
    let ts: i64 = timestamp.parse().map_err(|_| "timestamp is not a valid integer".to_string())?;
    let now = Utc::now().timestamp();
    if (now - ts).abs() > skew_secs {
        return Err(format!("timestamp {ts} is outside the allowed {skew_secs}s skew"));
    }

    let candidate_signatures = decode_signature(signature);
    if candidate_signatures.is_empty() {
        return Err("signature is neither valid hex nor base64".to_string());
    }

    let with_id = [webhook_id.as_bytes(), b".", timestamp.as_bytes(), b".", raw_body].concat();
    let without_id = [timestamp.as_bytes(), b".", raw_body].concat();

    for key in key_variants(secret.expose_secret()) {
        for message in [&with_id, &without_id] {
            let Some(expected) = mac_for(&key, message) else {
                continue;
            };
            for candidate in &candidate_signatures {
                if expected.len() == candidate.len() && bool::from(expected.ct_eq(candidate)) {
                    return Ok(());
                }
            }
        }
    }

    Err("signature did not match any known encoding".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(key: &[u8], message: &[u8]) -> String {
        mac_for(key, message).unwrap().iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn verifies_matching_signature_with_id_in_message() {
        let secret = SecretString::new("top-secret".to_string());
        let id = "wh_123";
        let ts = Utc::now().timestamp().to_string();
        let body = br#"{"hello":"world"}"#;
        let message = [id.as_bytes(), b".", ts.as_bytes(), b".", body.as_slice()].concat();
        let sig = sign(secret.expose_secret().as_bytes(), &message);

        assert!(verify_webhook_signature(&secret, id, &ts, body, &sig, 300).is_ok());
    }

    #[test]
    fn verifies_prefixed_signature_format() {
        let secret = SecretString::new("top-secret".to_string());
        let id = "wh_123";
        let ts = Utc::now().timestamp().to_string();
        let body = br#"{"a":1}"#;
        let message = [ts.as_bytes(), b".", body.as_slice()].concat();
        let sig = format!("sha256={}", sign(secret.expose_secret().as_bytes(), &message));

        assert!(verify_webhook_signature(&secret, id, &ts, body, &sig, 300).is_ok());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let secret = SecretString::new("top-secret".to_string());
        let id = "wh_123";
        let ts = (Utc::now().timestamp() - 10_000).to_string();
        let body = br#"{}"#;
        let message = [id.as_bytes(), b".", ts.as_bytes(), b".", body.as_slice()].concat();
        let sig = sign(secret.expose_secret().as_bytes(), &message);

        assert!(verify_webhook_signature(&secret, id, &ts, body, &sig, 300).is_err());
    }

    #[test]
    fn rejects_wrong_signature() {
        let secret = SecretString::new("top-secret".to_string());
        let id = "wh_123";
        let ts = Utc::now().timestamp().to_string();
        let body = br#"{}"#;

        assert!(verify_webhook_signature(&secret, id, &ts, body, "deadbeef", 300).is_err());
    }
}
