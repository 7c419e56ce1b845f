//! Key vault: per-identity key pairs and pairwise symmetric keys.
//!
//! Every onboarded identity gets a transport key pair; hospitals additionally
//! get a Paillier pair. Identity keys live in memory for the node's lifetime
//! (durable custody is out of scope). Pairwise keys are durable: they are
//! written to the pairwise-key table under `sha256(patient ∥ hospital)` and
//! cached in memory, created by a grant and destroyed by the matching revoke.
//! Revocation is a two-sided protocol: each side deletes its own copy when
//! the revoke event reaches it.

use crate::db::{self, Db};
use crate::errors::{ExchangeError, Result};
use crate::models::{Role, normalize_identity};
use he_crypto::paillier::{self, PaillierPrivateKey, PaillierPublicKey};
use he_crypto::tags::edge_hash;
use he_crypto::transport::{self, TransportCiphertext, TransportKeyPair, TransportPublicKey};
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

const PAIRWISE_KEY_LEN: usize = 32;

struct IdentityKeys {
    transport: TransportKeyPair,
    paillier: Option<(PaillierPublicKey, PaillierPrivateKey)>,
}

/// The shareable half of an identity's keys, returned from onboarding.
#[derive(Debug, Clone)]
pub struct PublicKeys {
    pub transport: TransportPublicKey,
    pub paillier: Option<PaillierPublicKey>,
}

pub struct KeyVault {
    db: Db,
    paillier_bits: u64,
    identities: RwLock<HashMap<String, Arc<IdentityKeys>>>,
    /// edge_hash -> pairwise key hex, write-through cache over the table.
    pairwise: RwLock<HashMap<String, String>>,
}

impl KeyVault {
    pub fn new(db: Db, paillier_bits: u64) -> Self {
        Self {
            db,
            paillier_bits,
            identities: RwLock::new(HashMap::new()),
            pairwise: RwLock::new(HashMap::new()),
        }
    }

    /// Onboard an identity. Idempotent: a repeat call returns the existing
    /// keys unchanged. Paillier generation runs on a blocking thread with no
    /// vault lock held, so readers never stall behind onboarding; a
    /// generation failure is a setup error for this request.
    pub async fn register_identity(&self, identity: &str, role: Role) -> Result<PublicKeys> {
        let identity = normalize_identity(identity);

        if let Some(existing) = self.identities.read().await.get(&identity) {
            debug!(%identity, "returning identity, reusing keys");
            return Ok(public_keys_of(existing));
        }

        info!(%identity, ?role, "new identity, generating keys");
        let transport = TransportKeyPair::generate(&mut OsRng);

        let paillier = match role {
            Role::Hospital => {
                let bits = self.paillier_bits;
                let pair = tokio::task::spawn_blocking(move || {
                    paillier::generate_keys(bits, &mut OsRng)
                })
                .await
                .map_err(|e| ExchangeError::Setup(format!("key generation task: {e}")))?
                .map_err(|e| ExchangeError::Setup(format!("homomorphic key generation: {e}")))?;
                Some(pair)
            }
            Role::Patient => None,
        };

        // A concurrent registration may have finished first; its keys win.
        let mut identities = self.identities.write().await;
        if let Some(existing) = identities.get(&identity) {
            debug!(%identity, "concurrent onboarding finished first, reusing its keys");
            return Ok(public_keys_of(existing));
        }

        let keys = Arc::new(IdentityKeys { transport, paillier });
        let publics = public_keys_of(&keys);
        identities.insert(identity, keys);
        Ok(publics)
    }

    pub async fn has_identity(&self, identity: &str) -> bool {
        self.identities
            .read()
            .await
            .contains_key(&normalize_identity(identity))
    }

    pub async fn public_keys(&self, identity: &str) -> Option<PublicKeys> {
        self.identities
            .read()
            .await
            .get(&normalize_identity(identity))
            .map(|k| public_keys_of(k))
    }

    pub async fn paillier_private(&self, identity: &str) -> Option<PaillierPrivateKey> {
        self.identities
            .read()
            .await
            .get(&normalize_identity(identity))
            .and_then(|k| k.paillier.as_ref().map(|(_, private)| private.clone()))
    }

    /// Open a sealed payload with a specific identity's transport key.
    pub async fn open_for(
        &self,
        identity: &str,
        sealed: &TransportCiphertext,
    ) -> Result<Vec<u8>> {
        let keys = {
            let identities = self.identities.read().await;
            identities
                .get(&normalize_identity(identity))
                .cloned()
                .ok_or_else(|| ExchangeError::Setup(format!("unknown identity {identity}")))?
        };
        Ok(keys.transport.open(sealed)?)
    }

    /// Try every locally hosted identity against a sealed payload. `None`
    /// means the payload is not addressed to this node (silence, not error).
    pub async fn open_with_any(
        &self,
        sealed: &TransportCiphertext,
    ) -> Option<(String, Vec<u8>)> {
        let identities: Vec<(String, Arc<IdentityKeys>)> = {
            let map = self.identities.read().await;
            map.iter().map(|(id, k)| (id.clone(), k.clone())).collect()
        };

        for (identity, keys) in identities {
            if let Ok(plaintext) = keys.transport.open(sealed) {
                return Some((identity, plaintext));
            }
        }
        None
    }

    /// Patient side of a grant: generate a fresh pairwise key, store it under
    /// the edge hash, and return it sealed to the hospital. Sealed is the
    /// only form in which the key ever leaves this process.
    pub async fn establish_pairwise_key(
        &self,
        patient: &str,
        hospital: &str,
        hospital_transport: &TransportPublicKey,
    ) -> Result<String> {
        let patient = normalize_identity(patient);
        let hospital = normalize_identity(hospital);

        let mut key = [0u8; PAIRWISE_KEY_LEN];
        OsRng.fill_bytes(&mut key);

        self.persist_pairwise(&patient, &hospital, &key).await?;

        let sealed = transport::seal(hospital_transport, &key, &mut OsRng)?;
        info!(%patient, %hospital, "established pairwise key for edge");
        Ok(sealed.to_base64())
    }

    /// Hospital side of a grant: store the key recovered from the sealed
    /// grant payload.
    pub async fn store_pairwise_key(
        &self,
        patient: &str,
        hospital: &str,
        key: &[u8],
    ) -> Result<()> {
        let patient = normalize_identity(patient);
        let hospital = normalize_identity(hospital);
        self.persist_pairwise(&patient, &hospital, key).await
    }

    pub async fn pairwise_key(&self, patient: &str, hospital: &str) -> Result<Option<Vec<u8>>> {
        let hash = edge_hash(&normalize_identity(patient), &normalize_identity(hospital));

        if let Some(hex_key) = self.pairwise.read().await.get(&hash) {
            let bytes = hex::decode(hex_key)
                .map_err(|_| ExchangeError::Setup("stored pairwise key is not hex".into()))?;
            return Ok(Some(bytes));
        }

        match db::get_pairwise_key(&self.db, &hash).await? {
            Some(hex_key) => {
                let bytes = hex::decode(&hex_key)
                    .map_err(|_| ExchangeError::Setup("stored pairwise key is not hex".into()))?;
                self.pairwise.write().await.insert(hash, hex_key);
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Delete the local copy of an edge's key. At most one key is live per
    /// edge, so after this the edge has none.
    pub async fn revoke_pairwise_key(&self, patient: &str, hospital: &str) -> Result<()> {
        let patient = normalize_identity(patient);
        let hospital = normalize_identity(hospital);
        let hash = edge_hash(&patient, &hospital);

        self.pairwise.write().await.remove(&hash);
        db::delete_pairwise_key(&self.db, &hash).await?;

        info!(%patient, %hospital, "pairwise key revoked");
        Ok(())
    }

    async fn persist_pairwise(&self, patient: &str, hospital: &str, key: &[u8]) -> Result<()> {
        let hash = edge_hash(patient, hospital);
        let key_hex = hex::encode(key);

        db::upsert_pairwise_key(&self.db, &hash, &key_hex).await?;
        self.pairwise.write().await.insert(hash, key_hex);
        Ok(())
    }
}

fn public_keys_of(keys: &IdentityKeys) -> PublicKeys {
    PublicKeys {
        transport: keys.transport.public(),
        paillier: keys.paillier.as_ref().map(|(public, _)| public.clone()),
    }
}
