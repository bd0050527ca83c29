//! SHA-256 digests and constant-time digest comparison.

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Lowercase hex SHA-256, the form carried in transfer metadata.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Constant-time comparison of two 32-byte values.
pub fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for i in 0..32 {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

/// Compare two hex-encoded SHA-256 digests without early exit on the bytes.
/// Anything that is not a 64-character hex string never matches.
pub fn digests_match(a_hex: &str, b_hex: &str) -> bool {
    let (Some(a), Some(b)) = (decode_digest(a_hex), decode_digest(b_hex)) else {
        return false;
    };
    constant_time_eq(&a, &b)
}

fn decode_digest(hex_str: &str) -> Option<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut out).ok()?;
    Some(out)
}
