use chrono::Utc;
use he_crypto::paillier::PaillierPublicKey;
use he_crypto::transport::TransportPublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identities are opaque wallet addresses. Grant, revoke, and commit events
/// may carry them in mixed case, so every entry point normalizes first;
/// tags and filter membership hash the normalized form.
pub fn normalize_identity(id: &str) -> String {
    id.trim().to_lowercase()
}

/// RFC 3339 timestamp string. Tags hash the string verbatim, so records keep
/// it as produced rather than re-rendering through a parsed value.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Hospital,
}

/// The vital-sign categories a record can carry. Never stored in the clear on
/// a record; recovered via the keyed classification tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricType {
    Heartbeat,
    Steps,
    SugarLevel,
}

impl MetricType {
    pub const ALL: [MetricType; 3] = [
        MetricType::Heartbeat,
        MetricType::Steps,
        MetricType::SugarLevel,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            MetricType::Heartbeat => "heartbeat",
            MetricType::Steps => "steps",
            MetricType::SugarLevel => "sugarLevel",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// One encrypted measurement as it transits the bulk channel and, once
/// verified, sits in hospital storage.
///
/// Invariants: `integrity_tag = sha256(ciphertext ∥ nonce ∥ timestamp)`;
/// `classification_tag` is the HMAC trapdoor over the metric type. The record
/// never carries the metric type in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub patient: String,
    pub hospital: String,
    pub ciphertext_hex: String,
    pub nonce_hex: String,
    pub timestamp: String,
    pub classification_tag: String,
    pub integrity_tag: String,
}

/// A hospital the patient has granted, with the public keys needed to encode
/// submissions for it. Owned by the patient's consent list.
#[derive(Debug, Clone)]
pub struct ConsentEdge {
    pub hospital: String,
    pub transport_public: TransportPublicKey,
    pub paillier_public: PaillierPublicKey,
}

/// Typed ledger events, consumed in arrival order from the event queue.
/// String/byte payloads only; no raw health data ever reaches the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEvent {
    ConsentGranted {
        patient: String,
        hospital: String,
        /// Base64 sealed-box over the fresh pairwise symmetric key.
        encrypted_key: String,
    },
    DataCommitted {
        patient: String,
        batch_digest: String,
        encrypted_nonce: String,
    },
    ConsentRevoked {
        patient: String,
        hospital: String,
    },
}

/// Outcome of one aggregation run for a hospital.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationReport {
    pub report_id: Uuid,
    pub hospital: String,
    pub generated_at: String,
    pub patients: Vec<PatientAverages>,
    /// Patients with verified records but no live pairwise key.
    pub skipped_patients: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatientAverages {
    pub patient: String,
    pub metrics: Vec<MetricAverage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricAverage {
    pub metric: MetricType,
    #[serde(flatten)]
    pub outcome: AverageOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AverageOutcome {
    /// Mean is the integer quotient; sum and count allow exact recomputation.
    Average { sum: u64, count: u64, mean: u64 },
    NoData,
    Unavailable { reason: String },
}
