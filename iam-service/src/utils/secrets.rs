use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// 32 random bytes, hex encoded.
pub fn random_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Compare a presented client secret with its stored SHA-256 hex digest in
/// constant time.
pub fn secret_matches(secret: &str, stored_hash: &str) -> bool {
    let presented = sha256_hex(secret);
    presented
        .as_bytes()
        .ct_eq(stored_hash.to_ascii_lowercase().as_bytes())
        .into()
}
