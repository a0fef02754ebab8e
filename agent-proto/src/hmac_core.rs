//! HMAC core: request authentication and combined-key derivation.
//!
//! `hmac(secret, uuid, nonce, timestamp) = HMAC-SHA256(secret,
//! "{uuid}:{hex(nonce)}:{timestamp}")`. Verification is constant-time.
//! `combined_key(shared, secret) = SHA-256(shared || secret)`, hex-encoded;
//! callers fall back to the raw `secret_key` when no shared secret is
//! configured (logged as a downgrade by the caller).

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// A 32-byte HMAC-SHA256 digest.
pub type Digest32 = [u8; 32];

fn canonical_message(uuid: &str, nonce: &[u8], timestamp: u64) -> String {
    format!("{uuid}:{}:{timestamp}", hex::encode(nonce))
}

/// Compute `HMAC-SHA256(secret, "{uuid}:{hex(nonce)}:{timestamp}")`.
pub fn hmac(secret: &[u8], uuid: &str, nonce: &[u8], timestamp: u64) -> Digest32 {
    let message = canonical_message(uuid, nonce, timestamp);
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Verify a previously-computed HMAC in constant time.
pub fn verify(secret: &[u8], uuid: &str, nonce: &[u8], timestamp: u64, candidate: &[u8]) -> bool {
    if candidate.len() != 32 {
        return false;
    }
    let expected = hmac(secret, uuid, nonce, timestamp);
    expected.ct_eq(candidate).into()
}

/// `SHA-256(shared_secret || secret_key)`, hex-encoded.
pub fn combined_key(shared_secret: &str, secret_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret.as_bytes());
    hasher.update(secret_key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_is_deterministic_and_verifies() {
        let secret = b"fleet-secret";
        let uuid = "00000001-0000-0000-0000-000000000001";
        let nonce = b"abc123";
        let ts = 1_700_000_000u64;

        let mac1 = hmac(secret, uuid, nonce, ts);
        let mac2 = hmac(secret, uuid, nonce, ts);
        assert_eq!(mac1, mac2);
        assert!(verify(secret, uuid, nonce, ts, &mac1));
    }

    #[test]
    fn single_bit_flip_fails_verification() {
        let secret = b"fleet-secret";
        let uuid = "00000001-0000-0000-0000-000000000001";
        let nonce = b"abc123";
        let ts = 1_700_000_000u64;

        let mut mac = hmac(secret, uuid, nonce, ts);
        mac[0] ^= 0x01;
        assert!(!verify(secret, uuid, nonce, ts, &mac));

        assert!(!verify(secret, uuid, nonce, ts + 1, &hmac(secret, uuid, nonce, ts)));
    }

    #[test]
    fn combined_key_is_deterministic_and_order_sensitive() {
        let k1 = combined_key("SHARED-XYZ", "per-drone-secret");
        let k2 = combined_key("SHARED-XYZ", "per-drone-secret");
        assert_eq!(k1, k2);

        let swapped = combined_key("per-drone-secret", "SHARED-XYZ");
        assert_ne!(k1, swapped);
    }
}
