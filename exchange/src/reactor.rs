//! Hospital-side event reactor and integrity verifier.
//!
//! One consumer task per node drains the typed ledger-event queue in arrival
//! order, which subsumes the required per-edge ordering (grant before data
//! before revoke). Every failure below a batch boundary is absorbed locally:
//! the loop never dies because one event was malformed, misaddressed, or
//! failed verification.
//!
//! Batch acceptance is all-or-nothing. The committed digest is checked
//! against the *originally received* tag sequence, never a survivor list,
//! so an adversary cannot suppress records whose tags were already invalid
//! and still present a matching digest.

use crate::bulk::{BulkChannel, fetch_with_retry};
use crate::config::Config;
use crate::consent::ConsentRegistry;
use crate::db::{self, Db};
use crate::errors::Result;
use crate::models::{LedgerEvent, normalize_identity};
use crate::vault::KeyVault;
use he_crypto::tags;
use he_crypto::transport::TransportCiphertext;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct EventReactor<B: BulkChannel> {
    db: Db,
    vault: Arc<KeyVault>,
    registry: Arc<ConsentRegistry>,
    bulk: Arc<B>,
    fetch_timeout: Duration,
    fetch_retries: u32,
}

impl<B: BulkChannel> EventReactor<B> {
    pub fn new(
        db: Db,
        vault: Arc<KeyVault>,
        registry: Arc<ConsentRegistry>,
        bulk: Arc<B>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            vault,
            registry,
            bulk,
            fetch_timeout: config.fetch_timeout,
            fetch_retries: config.fetch_retries,
        }
    }

    /// Drain the event queue until the sending side closes it.
    pub async fn run(self, mut events: mpsc::Receiver<LedgerEvent>) {
        info!("event reactor listening");
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!("ledger event stream closed, reactor stopping");
    }

    /// Process a single event. Errors are logged, never propagated; an
    /// event that cannot be applied leaves state untouched.
    pub async fn handle(&self, event: LedgerEvent) {
        match event {
            LedgerEvent::ConsentGranted {
                patient,
                hospital,
                encrypted_key,
            } => self.on_consent_granted(&patient, &hospital, &encrypted_key).await,
            LedgerEvent::DataCommitted {
                patient,
                batch_digest,
                encrypted_nonce,
            } => self.on_data_committed(&patient, &batch_digest, &encrypted_nonce).await,
            LedgerEvent::ConsentRevoked { patient, hospital } => {
                self.on_consent_revoked(&patient, &hospital).await
            }
        }
    }

    async fn on_consent_granted(&self, patient: &str, hospital: &str, encrypted_key: &str) {
        let patient = normalize_identity(patient);
        let hospital = normalize_identity(hospital);

        if !self.vault.has_identity(&hospital).await {
            debug!(%hospital, "consent grant for a hospital not hosted here");
            return;
        }

        let sealed = match TransportCiphertext::from_base64(encrypted_key) {
            Ok(sealed) => sealed,
            Err(e) => {
                error!(%patient, %hospital, error = %e, "grant payload unparseable");
                return;
            }
        };

        let key = match self.vault.open_for(&hospital, &sealed).await {
            Ok(key) => key,
            Err(e) => {
                // Wrong key or corrupted payload: no state change.
                error!(%patient, %hospital, error = %e, "failed to unseal pairwise key");
                return;
            }
        };

        if let Err(e) = self.apply_grant(&patient, &hospital, &key).await {
            error!(%patient, %hospital, error = %e, "failed to apply consent grant");
        }
    }

    async fn apply_grant(&self, patient: &str, hospital: &str, key: &[u8]) -> Result<()> {
        self.vault.store_pairwise_key(patient, hospital, key).await?;
        self.registry.add(patient, hospital).await?;
        info!(%patient, %hospital, "consent granted, pairwise key installed");
        Ok(())
    }

    async fn on_data_committed(&self, patient: &str, batch_digest: &str, encrypted_nonce: &str) {
        let patient = normalize_identity(patient);

        // Fast path: the filter has no false negatives, so a miss is a
        // certain non-member.
        if !self.registry.test(&patient).await {
            debug!(%patient, "commit from patient outside the permission filter");
            return;
        }

        let sealed = match TransportCiphertext::from_base64(encrypted_nonce) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(%patient, error = %e, "commit nonce payload unparseable");
                return;
            }
        };

        // Try every hosted identity; the AEAD tag is the addressing check.
        let Some((hospital, nonce)) = self.vault.open_with_any(&sealed).await else {
            debug!(%patient, "commit not addressed to any identity on this node");
            return;
        };
        let nonce_hex = hex::encode(&nonce);

        let records = match fetch_with_retry(
            self.bulk.as_ref(),
            &nonce_hex,
            self.fetch_timeout,
            self.fetch_retries,
        )
        .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(%patient, %hospital, error = %e, "dropping batch, bulk fetch failed");
                return;
            }
        };

        match self.verify_batch(&patient, &hospital, batch_digest, &records).await {
            Ok(()) => {}
            Err(e) => {
                error!(%patient, %hospital, error = %e, "batch rejected");
                return;
            }
        }

        match db::insert_verified_records(&self.db, &records).await {
            Ok(()) => {
                info!(%patient, %hospital, count = records.len(), "batch verified and stored")
            }
            Err(e) => error!(%patient, %hospital, error = %e, "failed to persist batch"),
        }
    }

    /// All-or-nothing verification of a fetched batch.
    async fn verify_batch(
        &self,
        patient: &str,
        hospital: &str,
        committed_digest: &str,
        records: &[crate::models::HealthRecord],
    ) -> Result<()> {
        use crate::errors::ExchangeError::Integrity;

        if records.is_empty() {
            return Err(Integrity("empty batch".into()));
        }

        // Attribution fields travel over the bulk channel outside the tag
        // construction. Bind them to the authenticated context: the event's
        // consented patient and the identity whose key opened the nonce.
        for record in records {
            if normalize_identity(&record.patient) != patient {
                return Err(Integrity(format!(
                    "record attributed to {} in a batch committed by {patient}",
                    record.patient
                )));
            }
            if normalize_identity(&record.hospital) != hospital {
                return Err(Integrity(format!(
                    "record addressed to {} in a batch opened by {hospital}",
                    record.hospital
                )));
            }
        }

        // Per-record check: each record must commit to its own fields. An
        // invalid record is dropped, and dropping any record fails the batch.
        let mut invalid = 0usize;
        let mut received_tags = Vec::with_capacity(records.len());
        for record in records {
            let recomputed =
                tags::integrity_tag(&record.ciphertext_hex, &record.nonce_hex, &record.timestamp);
            if recomputed != record.integrity_tag {
                warn!(%patient, tag = %record.integrity_tag, "record failed integrity check, dropped");
                invalid += 1;
            }
            received_tags.push(record.integrity_tag.as_str());
        }

        // Digest over the received sequence, exactly as transmitted.
        let recomputed_digest = tags::batch_digest(&received_tags);
        if recomputed_digest != committed_digest {
            return Err(Integrity(format!(
                "batch digest mismatch: committed {committed_digest}, received {recomputed_digest}"
            )));
        }
        if invalid > 0 {
            return Err(Integrity(format!(
                "{invalid} of {} records failed their integrity tags",
                records.len()
            )));
        }

        // Replay protection: integrity tags are unique storage keys.
        let mut seen = HashSet::new();
        for record in records {
            if !seen.insert(record.integrity_tag.as_str()) {
                return Err(Integrity(format!(
                    "duplicate integrity tag {} within batch",
                    record.integrity_tag
                )));
            }
            if db::integrity_tag_exists(&self.db, &record.integrity_tag).await? {
                return Err(Integrity(format!(
                    "integrity tag {} already stored (replay)",
                    record.integrity_tag
                )));
            }
        }

        Ok(())
    }

    async fn on_consent_revoked(&self, patient: &str, hospital: &str) {
        let patient = normalize_identity(patient);
        let hospital = normalize_identity(hospital);

        if !self.vault.has_identity(&hospital).await {
            debug!(%hospital, "revocation for a hospital not hosted here");
            return;
        }

        if let Err(e) = self.vault.revoke_pairwise_key(&patient, &hospital).await {
            error!(%patient, %hospital, error = %e, "failed to delete pairwise key");
        }
        if let Err(e) = self.registry.remove(&patient, &hospital).await {
            error!(%patient, %hospital, error = %e, "failed to update consent registry");
        }
        info!(%patient, %hospital, "consent revoked");
    }
}
