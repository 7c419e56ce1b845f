//! Sealed-box transport for small payloads.
//!
//! The only secrets that ever cross the ledger are a pairwise symmetric key
//! (on consent grant) and a batch nonce (on data commit). Both are sealed to
//! the recipient's X25519 public key: an ephemeral key pair is generated per
//! message, the ECDH shared secret is hashed into a ChaCha20-Poly1305 key,
//! and the AEAD tag doubles as the addressing check: opening with the wrong
//! private key fails authentication, which the event reactor treats as "not
//! addressed to this node".

use crate::CryptoError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

const EPK_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Public transport key, safe to publish and embed in consent edges.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TransportPublicKey(PublicKey);

impl TransportPublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)
            .map_err(|e| CryptoError::InvalidKey(format!("public key hex: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?;
        Ok(Self(PublicKey::from(arr)))
    }
}

impl std::fmt::Debug for TransportPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransportPublicKey({})", self.to_hex())
    }
}

/// Static transport key pair held by an identity for its lifetime.
///
/// The secret zeroizes on drop and never appears in `Debug` output.
pub struct TransportKeyPair {
    secret: StaticSecret,
    public: TransportPublicKey,
}

impl TransportKeyPair {
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let secret = StaticSecret::random_from_rng(&mut *rng);
        let public = TransportPublicKey(PublicKey::from(&secret));
        Self { secret, public }
    }

    pub fn public(&self) -> TransportPublicKey {
        self.public
    }

    /// Open a sealed payload addressed to this key.
    ///
    /// Any tampering, truncation, or mismatched key surfaces as
    /// [`CryptoError::Decryption`].
    pub fn open(&self, sealed: &TransportCiphertext) -> Result<Vec<u8>, CryptoError> {
        let epk = PublicKey::from(sealed.ephemeral_public);
        let shared = self.secret.diffie_hellman(&epk);
        let key = derive_key(shared.as_bytes(), &sealed.ephemeral_public, self.public.0.as_bytes());

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(|_| CryptoError::Decryption)
    }
}

impl std::fmt::Debug for TransportKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportKeyPair")
            .field("public", &self.public.to_hex())
            .finish()
    }
}

/// A sealed payload: ephemeral public key, AEAD nonce, ciphertext + tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCiphertext {
    pub ephemeral_public: [u8; EPK_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl TransportCiphertext {
    /// Compact base64 form carried in ledger event payloads.
    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(EPK_LEN + NONCE_LEN + self.ciphertext.len());
        bytes.extend_from_slice(&self.ephemeral_public);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        BASE64.encode(bytes)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| CryptoError::InvalidCiphertext(format!("base64: {e}")))?;
        if bytes.len() < EPK_LEN + NONCE_LEN {
            return Err(CryptoError::InvalidCiphertext("payload too short".into()));
        }

        let mut ephemeral_public = [0u8; EPK_LEN];
        ephemeral_public.copy_from_slice(&bytes[..EPK_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[EPK_LEN..EPK_LEN + NONCE_LEN]);

        Ok(Self {
            ephemeral_public,
            nonce,
            ciphertext: bytes[EPK_LEN + NONCE_LEN..].to_vec(),
        })
    }
}

/// Seal `plaintext` to `recipient`. A fresh ephemeral key pair per call.
pub fn seal(
    recipient: &TransportPublicKey,
    plaintext: &[u8],
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<TransportCiphertext, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(&mut *rng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient.0);

    let key = derive_key(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient.0.as_bytes(),
    );

    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(format!("aead: {e}")))?;

    Ok(TransportCiphertext {
        ephemeral_public: *ephemeral_public.as_bytes(),
        nonce,
        ciphertext,
    })
}

/// AEAD key = SHA-256(shared ∥ ephemeral_pk ∥ recipient_pk), binding the key
/// to both halves of the exchange.
fn derive_key(shared: &[u8], ephemeral_pk: &[u8], recipient_pk: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral_pk);
    hasher.update(recipient_pk);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn seal_open_roundtrip() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let pair = TransportKeyPair::generate(&mut rng);

        let sealed = seal(&pair.public(), b"pairwise-key-material", &mut rng).unwrap();
        assert_eq!(pair.open(&sealed).unwrap(), b"pairwise-key-material");
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let intended = TransportKeyPair::generate(&mut rng);
        let other = TransportKeyPair::generate(&mut rng);

        let sealed = seal(&intended.public(), b"nonce-bytes", &mut rng).unwrap();
        assert!(matches!(other.open(&sealed), Err(CryptoError::Decryption)));
    }

    #[test]
    fn base64_roundtrip() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let pair = TransportKeyPair::generate(&mut rng);

        let sealed = seal(&pair.public(), &[7u8; 16], &mut rng).unwrap();
        let reparsed = TransportCiphertext::from_base64(&sealed.to_base64()).unwrap();
        assert_eq!(reparsed, sealed);
        assert_eq!(pair.open(&reparsed).unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn tampered_payload_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let pair = TransportKeyPair::generate(&mut rng);

        let mut sealed = seal(&pair.public(), b"payload", &mut rng).unwrap();
        let last = sealed.ciphertext.len() - 1;
        sealed.ciphertext[last] ^= 0x01;
        assert!(pair.open(&sealed).is_err());
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let pair = TransportKeyPair::generate(&mut rng);

        let hex = pair.public().to_hex();
        assert_eq!(TransportPublicKey::from_hex(&hex).unwrap(), pair.public());
    }
}
