//! Cryptographic capability layer for the consent-gated health-data exchange.
//!
//! This crate contains:
//! - The Paillier additively homomorphic cryptosystem over arbitrary-precision
//!   integers (per-record encryption, sum-in-ciphertext aggregation).
//! - Sealed-box key transport (ephemeral X25519 + ChaCha20-Poly1305) for the
//!   small payloads that cross the ledger: pairwise symmetric keys and batch
//!   nonces.
//! - The tag and digest constructions: integrity tags, keyed classification
//!   tags, and the order-sensitive batch digest anchored on the ledger.

use thiserror::Error;

pub mod paillier;
pub mod tags;
pub mod transport;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failure. Deliberately carries no detail: for transport
    /// payloads this is the normal "not addressed to this key" signal.
    #[error("decryption failed")]
    Decryption,

    #[error("plaintext out of range for modulus")]
    PlaintextRange,

    #[error("malformed key material: {0}")]
    InvalidKey(String),

    #[error("malformed ciphertext: {0}")]
    InvalidCiphertext(String),
}
