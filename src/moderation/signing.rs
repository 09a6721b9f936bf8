//! Request signing for the content audit service.
//!
//! The signature is HMAC-SHA256, keyed with the shared secret, over the
//! ASCII-sorted `key=value` pairs of app id, nonce, unix timestamp and the
//! secret itself, joined by `&`, hex-encoded in upper case.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::backend::AuditError;

type HmacSha256 = Hmac<Sha256>;

/// Fixed nonce expected by the audit service.
pub const NONCE: &str = "123456";

pub const HEADER_APP_ID: &str = "Api-Appid";
pub const HEADER_NONCE: &str = "Api-Nonce-Str";
pub const HEADER_TIMESTAMP: &str = "Api-Timestamp";
pub const HEADER_SIGN: &str = "Api-Sign";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub app_id: String,
    pub nonce: String,
    pub timestamp: i64,
    pub sign: String,
}

impl SignedHeaders {
    pub fn new(app_id: &str, secret: &str, timestamp: i64) -> Result<Self, AuditError> {
        let payload = canonical_string(app_id, secret, timestamp);
        Ok(Self {
            app_id: app_id.to_string(),
            nonce: NONCE.to_string(),
            timestamp,
            sign: hmac_hex_upper(secret.as_bytes(), payload.as_bytes())?,
        })
    }

    /// Header name/value pairs sent alongside the request
    pub fn pairs(&self) -> [(&'static str, String); 4] {
        [
            (HEADER_APP_ID, self.app_id.clone()),
            (HEADER_NONCE, self.nonce.clone()),
            (HEADER_TIMESTAMP, self.timestamp.to_string()),
            (HEADER_SIGN, self.sign.clone()),
        ]
    }
}

pub fn canonical_string(app_id: &str, secret: &str, timestamp: i64) -> String {
    let mut fields = BTreeMap::new();
    fields.insert(HEADER_APP_ID, app_id.to_string());
    fields.insert(HEADER_NONCE, NONCE.to_string());
    fields.insert(HEADER_TIMESTAMP, timestamp.to_string());
    fields.insert("key", secret.to_string());

    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_hex_upper(key: &[u8], data: &[u8]) -> Result<String, AuditError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AuditError::Signing(format!("HMAC-SHA256 key init failed: {e}")))?;
    mac.update(data);
    Ok(hex::encode_upper(mac.finalize().into_bytes()))
}
