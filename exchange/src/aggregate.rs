//! Aggregation over verified ciphertexts.
//!
//! Records carry no metric type; for each record the engine recomputes the
//! candidate classification tag for every known metric under the patient's
//! pairwise key and the record's own nonce and timestamp, and the matching
//! candidate names the group. Each group is combined by modular
//! multiplication under n² into one sum ciphertext, decrypted exactly once
//! per (patient, metric), never per record.
//!
//! Runs against a point-in-time snapshot of the verified store: writers are
//! never blocked, and a record landing mid-computation may or may not be
//! included.

use crate::db::{self, Db};
use crate::errors::{ExchangeError, Result};
use crate::models::{
    AggregationReport, AverageOutcome, HealthRecord, MetricAverage, MetricType, PatientAverages,
    normalize_identity, now_rfc3339,
};
use crate::vault::KeyVault;
use he_crypto::paillier::PaillierPrivateKey;
use he_crypto::tags;
use num_bigint::BigUint;
use num_traits::One;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct AggregationEngine {
    db: Db,
    vault: Arc<KeyVault>,
}

impl AggregationEngine {
    pub fn new(db: Db, vault: Arc<KeyVault>) -> Self {
        Self { db, vault }
    }

    /// Compute per-patient averages for every metric, for one hospital
    /// identity hosted on this node.
    pub async fn patient_averages(&self, hospital: &str) -> Result<AggregationReport> {
        let hospital = normalize_identity(hospital);

        let private = self
            .vault
            .paillier_private(&hospital)
            .await
            .ok_or_else(|| {
                ExchangeError::Setup(format!("no homomorphic private key for {hospital}"))
            })?;

        let snapshot = db::list_verified_records(&self.db, &hospital).await?;
        info!(%hospital, records = snapshot.len(), "aggregating verified records");

        let mut by_patient: BTreeMap<String, Vec<HealthRecord>> = BTreeMap::new();
        for record in snapshot {
            by_patient.entry(record.patient.clone()).or_default().push(record);
        }

        let mut report = AggregationReport {
            report_id: Uuid::new_v4(),
            hospital: hospital.clone(),
            generated_at: now_rfc3339(),
            patients: Vec::new(),
            skipped_patients: Vec::new(),
        };

        for (patient, records) in by_patient {
            let Some(pairwise_key) = self.vault.pairwise_key(&patient, &hospital).await? else {
                // Revoked or never granted here: the ciphertexts stay opaque.
                warn!(%patient, %hospital, "no pairwise key, skipping patient");
                report.skipped_patients.push(patient);
                continue;
            };

            let groups = classify(&records, &pairwise_key);
            let metrics = MetricType::ALL
                .iter()
                .map(|&metric| MetricAverage {
                    metric,
                    outcome: summarize(&private, groups.get(&metric).map_or(&[][..], Vec::as_slice)),
                })
                .collect();

            report.patients.push(PatientAverages { patient, metrics });
        }

        Ok(report)
    }
}

/// Resolve each record's metric type via its classification tag and group the
/// ciphertexts. Unresolvable records (foreign key, malformed ciphertext) are
/// skipped with a warning; they cannot contribute to any group.
fn classify(records: &[HealthRecord], pairwise_key: &[u8]) -> BTreeMap<MetricType, Vec<BigUint>> {
    let mut groups: BTreeMap<MetricType, Vec<BigUint>> = BTreeMap::new();

    for record in records {
        let resolved = MetricType::ALL.iter().find(|metric| {
            tags::classification_tag(
                metric.wire_name(),
                pairwise_key,
                &record.nonce_hex,
                &record.timestamp,
            ) == record.classification_tag
        });

        let Some(&metric) = resolved else {
            warn!(tag = %record.classification_tag, "classification tag matches no known metric");
            continue;
        };

        match BigUint::parse_bytes(record.ciphertext_hex.as_bytes(), 16) {
            Some(ciphertext) => groups.entry(metric).or_default().push(ciphertext),
            None => warn!(tag = %record.integrity_tag, "malformed ciphertext skipped"),
        }
    }

    groups
}

/// Combine one group into a single sum ciphertext and decrypt it once.
fn summarize(private: &PaillierPrivateKey, ciphertexts: &[BigUint]) -> AverageOutcome {
    if ciphertexts.is_empty() {
        return AverageOutcome::NoData;
    }

    let public = private.public();
    let combined = ciphertexts
        .iter()
        .fold(BigUint::one(), |acc, c| public.combine(&acc, c));

    match private.decrypt_u64(&combined) {
        Ok(sum) => {
            let count = ciphertexts.len() as u64;
            debug!(sum, count, "decrypted group sum");
            AverageOutcome::Average {
                sum,
                count,
                mean: sum / count,
            }
        }
        Err(e) => {
            // One metric failing never aborts the others.
            warn!(error = %e, "group decryption failed, reporting unavailable");
            AverageOutcome::Unavailable {
                reason: e.to_string(),
            }
        }
    }
}
