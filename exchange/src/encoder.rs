//! Patient-side submission encoder.
//!
//! Turns a plaintext metric map into one independent ciphertext batch per
//! consented hospital: Paillier-encrypted values, keyed classification tags,
//! an ordered integrity-tag accumulator, and a single O(1) ledger commitment
//! (batch digest + sealed nonce). Hospitals fail independently: a missing
//! pairwise key or a bulk publish failure skips that hospital and the rest
//! proceed.

use crate::bulk::BulkChannel;
use crate::db::{self, Db};
use crate::errors::{ExchangeError, Result};
use crate::models::{HealthRecord, LedgerEvent, MetricType, normalize_identity, now_rfc3339};
use crate::vault::KeyVault;
use he_crypto::{tags, transport};
use num_bigint::BigUint;
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

const BATCH_NONCE_LEN: usize = 16;

pub struct SubmissionEncoder<B: BulkChannel> {
    db: Db,
    vault: Arc<KeyVault>,
    bulk: Arc<B>,
    ledger: mpsc::Sender<LedgerEvent>,
}

/// Per-submission result under the partial-success model.
#[derive(Debug)]
pub struct SubmissionOutcome {
    pub submission_id: Uuid,
    /// Hospitals whose commitment reached the ledger channel.
    pub committed: Vec<String>,
    /// Hospitals skipped, with the reason.
    pub skipped: Vec<(String, ExchangeError)>,
}

impl<B: BulkChannel> SubmissionEncoder<B> {
    pub fn new(
        db: Db,
        vault: Arc<KeyVault>,
        bulk: Arc<B>,
        ledger: mpsc::Sender<LedgerEvent>,
    ) -> Self {
        Self {
            db,
            vault,
            bulk,
            ledger,
        }
    }

    /// Encode and publish one submission to every hospital on the patient's
    /// consent list. Returns an error only when the submission is empty or
    /// no consent list exists at all; per-hospital failures land in
    /// `skipped`.
    pub async fn submit(
        &self,
        patient: &str,
        metrics: &BTreeMap<MetricType, u64>,
    ) -> Result<SubmissionOutcome> {
        let patient = normalize_identity(patient);

        if metrics.is_empty() {
            return Err(ExchangeError::Setup(format!(
                "submission for {patient} carries no metrics"
            )));
        }

        let edges = db::list_consent_edges(&self.db, &patient).await?;

        if edges.is_empty() {
            return Err(ExchangeError::Setup(format!(
                "patient {patient} has granted no hospitals"
            )));
        }

        let submission_id = Uuid::new_v4();
        let mut outcome = SubmissionOutcome {
            submission_id,
            committed: Vec::new(),
            skipped: Vec::new(),
        };

        for edge in edges {
            match self.encode_for_hospital(&patient, metrics, &edge).await {
                Ok(()) => outcome.committed.push(edge.hospital),
                Err(e) => {
                    warn!(%patient, hospital = %edge.hospital, error = %e,
                          "skipping hospital for this submission");
                    outcome.skipped.push((edge.hospital, e));
                }
            }
        }

        info!(%patient, %submission_id,
              committed = outcome.committed.len(), skipped = outcome.skipped.len(),
              "submission encoded");
        Ok(outcome)
    }

    async fn encode_for_hospital(
        &self,
        patient: &str,
        metrics: &BTreeMap<MetricType, u64>,
        edge: &crate::models::ConsentEdge,
    ) -> Result<()> {
        let pairwise_key = self
            .vault
            .pairwise_key(patient, &edge.hospital)
            .await?
            .ok_or_else(|| ExchangeError::Consent {
                patient: patient.to_string(),
                hospital: edge.hospital.clone(),
            })?;

        // One fresh nonce per (submission, hospital) batch.
        let mut nonce = [0u8; BATCH_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let nonce_hex = hex::encode(nonce);

        let mut records = Vec::with_capacity(metrics.len());
        let mut tag_accumulator = Vec::with_capacity(metrics.len());

        for (metric, value) in metrics {
            let timestamp = now_rfc3339();
            let ciphertext = edge
                .paillier_public
                .encrypt(&BigUint::from(*value), &mut OsRng)?;
            let ciphertext_hex = format!("{ciphertext:x}");

            let classification_tag = tags::classification_tag(
                metric.wire_name(),
                &pairwise_key,
                &nonce_hex,
                &timestamp,
            );
            let integrity_tag = tags::integrity_tag(&ciphertext_hex, &nonce_hex, &timestamp);
            tag_accumulator.push(integrity_tag.clone());

            records.push(HealthRecord {
                patient: patient.to_string(),
                hospital: edge.hospital.clone(),
                ciphertext_hex,
                nonce_hex: nonce_hex.clone(),
                timestamp,
                classification_tag,
                integrity_tag,
            });
        }

        // Order-sensitive digest over the accumulator; the ledger sees only
        // this and the sealed nonce, regardless of metric count.
        let batch_digest = tags::batch_digest(&tag_accumulator);
        let sealed_nonce = transport::seal(&edge.transport_public, &nonce, &mut OsRng)?;

        self.bulk.put(&nonce_hex, records).await?;

        self.ledger
            .send(LedgerEvent::DataCommitted {
                patient: patient.to_string(),
                batch_digest,
                encrypted_nonce: sealed_nonce.to_base64(),
            })
            .await
            .map_err(|_| ExchangeError::Transport("ledger channel closed".into()))?;

        Ok(())
    }
}
