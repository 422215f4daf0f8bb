//! Webhook signature verification.
//!
//! The provider signs the raw request body with HMAC-SHA256 and sends the
//! base64 digest in `X-Turn-Hook-Signature`. Comparison is constant-time.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::WebhookError;

pub const SIGNATURE_HEADER: &str = "X-Turn-Hook-Signature";

/// Compute the expected signature for a body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verify a signature header against the raw body.
///
/// An absent or empty header is Unauthorized; a present-but-wrong signature
/// is Forbidden.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), WebhookError> {
    let signature = header
        .filter(|value| !value.is_empty())
        .ok_or(WebhookError::MissingSignature)?;

    let expected = sign(secret, body);
    if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        Ok(())
    } else {
        Err(WebhookError::SignatureMismatch)
    }
}
