//! HMAC-SHA256 verification of vendor webhook deliveries.

use axum::http::StatusCode;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex signature of the raw body.
pub const SIGNATURE_HEADER: &str = "X-Pfy-Signature";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Why a delivery was rejected before its body was looked at.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("webhook secret is not configured")]
    NotConfigured,

    #[error("missing required signature header: X-Pfy-Signature")]
    MissingSignature,

    #[error("signature is not valid hex")]
    InvalidSignatureFormat,

    #[error("signature verification failed")]
    VerificationFailed,
}

impl VerificationError {
    /// All rejections map to 403.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::FORBIDDEN
    }
}

/// Computes the hex signature the vendor is expected to send for `body`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, VerificationError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::NotConfigured)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks `signature` (hex, optionally `sha256=`-prefixed) against the
/// HMAC-SHA256 of `body` under `secret`.
pub fn verify_signature(
    secret: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), VerificationError> {
    let secret = secret
        .filter(|secret| !secret.is_empty())
        .ok_or(VerificationError::NotConfigured)?;
    let signature = signature
        .map(str::trim)
        .filter(|signature| !signature.is_empty())
        .ok_or(VerificationError::MissingSignature)?;

    let provided_hex = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    let provided =
        hex::decode(provided_hex).map_err(|_| VerificationError::InvalidSignatureFormat)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if bool::from(expected.as_slice().ct_eq(&provided)) {
        debug!(body_size = body.len(), "Webhook signature verified");
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"type":"order.cancelled","data":{"order_id":"o1"}}"#;

    #[test]
    fn accepts_plain_and_prefixed_signatures() {
        let signature = sign(SECRET, BODY).unwrap();
        assert!(verify_signature(Some(SECRET), BODY, Some(&signature)).is_ok());

        let prefixed = format!("sha256={signature}");
        assert!(verify_signature(Some(SECRET), BODY, Some(&prefixed)).is_ok());
    }

    #[test]
    fn rejects_tampered_body_and_wrong_secret() {
        let signature = sign(SECRET, BODY).unwrap();
        assert_eq!(
            verify_signature(Some(SECRET), b"{}", Some(&signature)),
            Err(VerificationError::VerificationFailed)
        );
        assert_eq!(
            verify_signature(Some("other"), BODY, Some(&signature)),
            Err(VerificationError::VerificationFailed)
        );
    }

    #[test]
    fn rejects_missing_pieces() {
        let signature = sign(SECRET, BODY).unwrap();
        assert_eq!(
            verify_signature(None, BODY, Some(&signature)),
            Err(VerificationError::NotConfigured)
        );
        assert_eq!(
            verify_signature(Some(""), BODY, Some(&signature)),
            Err(VerificationError::NotConfigured)
        );
        assert_eq!(
            verify_signature(Some(SECRET), BODY, None),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_signature(Some(SECRET), BODY, Some("zz-not-hex")),
            Err(VerificationError::InvalidSignatureFormat)
        );
    }

    #[test]
    fn truncated_signature_does_not_match() {
        let signature = sign(SECRET, BODY).unwrap();
        assert_eq!(
            verify_signature(Some(SECRET), BODY, Some(&signature[..32])),
            Err(VerificationError::VerificationFailed)
        );
        assert_eq!(
            VerificationError::VerificationFailed.status_code(),
            StatusCode::FORBIDDEN
        );
    }
}
