use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Verifies the `x-signature` header against the exact raw request body.
///
/// The expected signature is the lowercase hex encoding of
/// HMAC-SHA256(secret, raw_body). The comparison happens on the hex strings
/// themselves in constant time, so a digest presented in uppercase does not
/// match even though it decodes to the same bytes. Any malformed input
/// (wrong length, non-hex characters, algorithm prefixes) simply fails the
/// comparison; this function never panics and never errors.
///
/// Signing the raw bytes rather than a re-serialized JSON form avoids
/// canonicalization mismatches between the provider and this service.
pub fn verify(raw_body: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(raw_body);
    let expected = hex::encode(mac.finalize().into_bytes());

    expected
        .as_bytes()
        .ct_eq(signature_header.as_bytes())
        .into()
}
