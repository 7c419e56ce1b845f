//! Tag and digest constructions.
//!
//! Three hash commitments coordinate the off-chain transfer with its on-ledger
//! anchor:
//!
//! - `integrity_tag = SHA-256(ciphertext ∥ nonce ∥ timestamp)` detects
//!   per-record tampering; also the unique storage key (replay protection).
//! - `classification_tag = HMAC-SHA-256(pairwise_key, metric ∥ nonce ∥ timestamp)`
//!   lets a pairwise-key holder recover a record's metric type without
//!   decrypting it; everyone else sees an opaque value.
//! - `batch_digest = SHA-256(tag_1 ∥ … ∥ tag_k)` in submission order is the
//!   O(1) ledger commitment over a whole batch; reordering or dropping any
//!   record changes it.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex SHA-256.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Key of the pairwise-key table: `SHA-256(patient ∥ hospital)`.
pub fn edge_hash(patient: &str, hospital: &str) -> String {
    sha256_hex(&format!("{patient}{hospital}"))
}

/// Per-record integrity commitment.
pub fn integrity_tag(ciphertext_hex: &str, nonce_hex: &str, timestamp: &str) -> String {
    sha256_hex(&format!("{ciphertext_hex}{nonce_hex}{timestamp}"))
}

/// Keyed classification tag (trapdoor) for one record.
pub fn classification_tag(metric: &str, key: &[u8], nonce_hex: &str, timestamp: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(metric.as_bytes());
    mac.update(nonce_hex.as_bytes());
    mac.update(timestamp.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Order-sensitive digest over a batch's integrity tags.
pub fn batch_digest<S: AsRef<str>>(tags: &[S]) -> String {
    let mut concatenated = String::new();
    for tag in tags {
        concatenated.push_str(tag.as_ref());
    }
    sha256_hex(&concatenated)
}
