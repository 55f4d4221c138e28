//! `X-Hub-Signature-256` verification for inbound deliveries.

use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("no app secret configured")]
    Misconfigured,

    #[error("missing X-Hub-Signature-256 header")]
    Missing,

    #[error("malformed X-Hub-Signature-256 header")]
    Malformed,

    #[error("HMAC signature mismatch")]
    Mismatch,
}

impl SignatureError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Misconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Missing => StatusCode::UNAUTHORIZED,
            Self::Malformed | Self::Mismatch => StatusCode::FORBIDDEN,
        }
    }

    /// Short plain-text body returned to the caller.
    pub fn body(&self) -> &'static str {
        match self {
            Self::Misconfigured => "Server misconfigured",
            Self::Missing => "Missing signature",
            Self::Malformed | Self::Mismatch => "Invalid signature",
        }
    }
}

/// Check `sha256=<hex>` against an HMAC-SHA256 of the raw body.
///
/// Without a secret the request passes only when `require` is false.
pub fn verify_signature(
    headers: &HeaderMap,
    body: &[u8],
    secret: Option<&str>,
    require: bool,
) -> Result<(), SignatureError> {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return if require {
            Err(SignatureError::Misconfigured)
        } else {
            Ok(())
        };
    };

    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(SignatureError::Missing)?;

    let sig_hex = header
        .strip_prefix("sha256=")
        .ok_or(SignatureError::Malformed)?;
    let expected = hex::decode(sig_hex).map_err(|_| SignatureError::Malformed)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Misconfigured)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Hex signature header value for `body`, as the platform would send it.
#[cfg(test)]
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
