//! End-to-end protocol tests: two in-process nodes sharing a bulk channel
//! and a ledger event queue, with small Paillier keys to keep onboarding
//! fast.

use exchange::aggregate::AggregationEngine;
use exchange::bulk::{BulkChannel, InMemoryBulkStore};
use exchange::config::Config;
use exchange::consent::ConsentRegistry;
use exchange::db::{self, Db};
use exchange::encoder::SubmissionEncoder;
use exchange::models::{AverageOutcome, ConsentEdge, HealthRecord, LedgerEvent, MetricType, Role};
use exchange::reactor::EventReactor;
use exchange::vault::{KeyVault, PublicKeys};
use he_crypto::{tags, transport};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const HOSPITAL: &str = "general-hospital";
const PATIENT: &str = "alice";

struct Harness {
    patient_db: Db,
    hospital_db: Db,
    patient_vault: Arc<KeyVault>,
    hospital_vault: Arc<KeyVault>,
    hospital_keys: PublicKeys,
    bulk: Arc<InMemoryBulkStore>,
    ledger_tx: mpsc::Sender<LedgerEvent>,
    reactor: JoinHandle<()>,
}

impl Harness {
    /// Both nodes up, one hospital identity onboarded, reactor running.
    async fn start() -> Self {
        let config = Config {
            paillier_bits: 512,
            fetch_timeout: Duration::from_millis(500),
            fetch_retries: 1,
            ..Config::default()
        };

        let patient_db = memory_db().await;
        let hospital_db = memory_db().await;

        let hospital_vault = Arc::new(KeyVault::new(hospital_db.clone(), config.paillier_bits));
        let hospital_keys = hospital_vault
            .register_identity(HOSPITAL, Role::Hospital)
            .await
            .unwrap();

        let patient_vault = Arc::new(KeyVault::new(patient_db.clone(), config.paillier_bits));
        patient_vault
            .register_identity(PATIENT, Role::Patient)
            .await
            .unwrap();

        let registry = Arc::new(
            ConsentRegistry::open(hospital_db.clone(), "hospital-node", &config)
                .await
                .unwrap(),
        );

        let bulk = Arc::new(InMemoryBulkStore::new());
        let (ledger_tx, ledger_rx) = mpsc::channel(64);

        let reactor = EventReactor::new(
            hospital_db.clone(),
            hospital_vault.clone(),
            registry,
            bulk.clone(),
            &config,
        );
        let reactor = tokio::spawn(reactor.run(ledger_rx));

        Self {
            patient_db,
            hospital_db,
            patient_vault,
            hospital_vault,
            hospital_keys,
            bulk,
            ledger_tx,
            reactor,
        }
    }

    /// Grant the hospital: seal a pairwise key, record the edge on the
    /// patient node, announce on the ledger.
    async fn grant(&self) {
        let encrypted_key = self
            .patient_vault
            .establish_pairwise_key(PATIENT, HOSPITAL, &self.hospital_keys.transport)
            .await
            .unwrap();
        db::upsert_consent_edge(
            &self.patient_db,
            PATIENT,
            &ConsentEdge {
                hospital: HOSPITAL.to_string(),
                transport_public: self.hospital_keys.transport,
                paillier_public: self.hospital_keys.paillier.clone().unwrap(),
            },
        )
        .await
        .unwrap();

        self.ledger_tx
            .send(LedgerEvent::ConsentGranted {
                patient: PATIENT.to_string(),
                hospital: HOSPITAL.to_string(),
                encrypted_key,
            })
            .await
            .unwrap();
    }

    fn encoder(&self) -> SubmissionEncoder<InMemoryBulkStore> {
        SubmissionEncoder::new(
            self.patient_db.clone(),
            self.patient_vault.clone(),
            self.bulk.clone(),
            self.ledger_tx.clone(),
        )
    }

    /// Close the queue and wait until every published event is applied.
    async fn drain(self) -> (Db, Arc<KeyVault>) {
        drop(self.ledger_tx);
        self.reactor.await.unwrap();
        (self.hospital_db, self.hospital_vault)
    }
}

async fn memory_db() -> Db {
    // Unique shared-cache URI so the pool's connections all see one database.
    let url = format!("sqlite:file:{}?mode=memory&cache=shared", Uuid::new_v4());
    let db = db::connect(&url).await.unwrap();
    db::init_schema(&db).await.unwrap();
    db
}

fn outcome_for(report: &exchange::models::AggregationReport, metric: MetricType) -> AverageOutcome {
    let patient = report
        .patients
        .iter()
        .find(|p| p.patient == PATIENT)
        .expect("patient missing from report");
    patient
        .metrics
        .iter()
        .find(|m| m.metric == metric)
        .expect("metric missing from report")
        .outcome
        .clone()
}

#[tokio::test]
async fn single_submission_averages_every_metric() {
    let h = Harness::start().await;
    h.grant().await;

    let metrics = BTreeMap::from([
        (MetricType::Heartbeat, 72),
        (MetricType::Steps, 8000),
        (MetricType::SugarLevel, 90),
    ]);
    let outcome = h.encoder().submit(PATIENT, &metrics).await.unwrap();
    assert_eq!(outcome.committed, vec![HOSPITAL.to_string()]);
    assert!(outcome.skipped.is_empty());

    let (hospital_db, hospital_vault) = h.drain().await;
    assert_eq!(
        db::count_verified_records(&hospital_db, HOSPITAL).await.unwrap(),
        3
    );

    let engine = AggregationEngine::new(hospital_db, hospital_vault);
    let report = engine.patient_averages(HOSPITAL).await.unwrap();
    assert!(report.skipped_patients.is_empty());

    for (metric, expected) in [
        (MetricType::Heartbeat, 72),
        (MetricType::Steps, 8000),
        (MetricType::SugarLevel, 90),
    ] {
        assert_eq!(
            outcome_for(&report, metric),
            AverageOutcome::Average {
                sum: expected,
                count: 1,
                mean: expected
            }
        );
    }
}

#[tokio::test]
async fn repeated_submissions_average_homomorphically() {
    let h = Harness::start().await;
    h.grant().await;

    let encoder = h.encoder();
    encoder
        .submit(PATIENT, &BTreeMap::from([(MetricType::SugarLevel, 90)]))
        .await
        .unwrap();
    encoder
        .submit(PATIENT, &BTreeMap::from([(MetricType::SugarLevel, 110)]))
        .await
        .unwrap();
    drop(encoder);

    let (hospital_db, hospital_vault) = h.drain().await;
    let engine = AggregationEngine::new(hospital_db, hospital_vault);
    let report = engine.patient_averages(HOSPITAL).await.unwrap();

    assert_eq!(
        outcome_for(&report, MetricType::SugarLevel),
        AverageOutcome::Average {
            sum: 200,
            count: 2,
            mean: 100
        }
    );
    assert_eq!(outcome_for(&report, MetricType::Heartbeat), AverageOutcome::NoData);
    assert_eq!(outcome_for(&report, MetricType::Steps), AverageOutcome::NoData);
}

#[tokio::test]
async fn identity_casing_is_normalized_end_to_end() {
    let h = Harness::start().await;

    // Grant and submit under mixed casing; everything lands lowercased.
    let encrypted_key = h
        .patient_vault
        .establish_pairwise_key("Alice", "General-Hospital", &h.hospital_keys.transport)
        .await
        .unwrap();
    db::upsert_consent_edge(
        &h.patient_db,
        PATIENT,
        &ConsentEdge {
            hospital: HOSPITAL.to_string(),
            transport_public: h.hospital_keys.transport,
            paillier_public: h.hospital_keys.paillier.clone().unwrap(),
        },
    )
    .await
    .unwrap();
    h.ledger_tx
        .send(LedgerEvent::ConsentGranted {
            patient: "Alice".to_string(),
            hospital: "General-Hospital".to_string(),
            encrypted_key,
        })
        .await
        .unwrap();

    h.encoder()
        .submit("ALICE", &BTreeMap::from([(MetricType::Heartbeat, 60)]))
        .await
        .unwrap();

    let (hospital_db, hospital_vault) = h.drain().await;
    let engine = AggregationEngine::new(hospital_db, hospital_vault);
    let report = engine.patient_averages("GENERAL-hospital").await.unwrap();
    assert_eq!(report.hospital, HOSPITAL);
    assert_eq!(
        outcome_for(&report, MetricType::Heartbeat),
        AverageOutcome::Average {
            sum: 60,
            count: 1,
            mean: 60
        }
    );
}

/// Build a batch by hand so individual records can be tampered with after
/// the digest is committed.
async fn handcrafted_batch(h: &Harness, values: &[(MetricType, u64)]) -> (Vec<HealthRecord>, String, String) {
    let pairwise_key = h
        .patient_vault
        .pairwise_key(PATIENT, HOSPITAL)
        .await
        .unwrap()
        .expect("grant must precede submission");

    let nonce: [u8; 16] = rand::random();
    let nonce_hex = hex::encode(nonce);
    let public = h.hospital_keys.paillier.clone().unwrap();

    let mut records = Vec::new();
    let mut tag_order = Vec::new();
    for (metric, value) in values {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let ciphertext_hex = format!(
            "{:x}",
            public.encrypt(&BigUint::from(*value), &mut OsRng).unwrap()
        );
        let integrity_tag = tags::integrity_tag(&ciphertext_hex, &nonce_hex, &timestamp);
        tag_order.push(integrity_tag.clone());
        records.push(HealthRecord {
            patient: PATIENT.to_string(),
            hospital: HOSPITAL.to_string(),
            classification_tag: tags::classification_tag(
                metric.wire_name(),
                &pairwise_key,
                &nonce_hex,
                &timestamp,
            ),
            ciphertext_hex,
            nonce_hex: nonce_hex.clone(),
            timestamp,
            integrity_tag,
        });
    }

    let digest = tags::batch_digest(&tag_order);
    let sealed = transport::seal(&h.hospital_keys.transport, &nonce, &mut OsRng)
        .unwrap()
        .to_base64();
    (records, digest, sealed)
}

#[tokio::test]
async fn corrupted_record_rejects_the_whole_batch() {
    let h = Harness::start().await;
    h.grant().await;

    let (mut records, digest, sealed) = handcrafted_batch(
        &h,
        &[(MetricType::Heartbeat, 72), (MetricType::Steps, 8000)],
    )
    .await;

    // Tamper with one ciphertext after the digest was fixed. Its integrity
    // tag no longer matches, and the intact sibling must not survive either.
    let flipped = if records[1].ciphertext_hex.starts_with('0') { "1" } else { "0" };
    records[1].ciphertext_hex.replace_range(..1, flipped);

    let nonce_hex = records[0].nonce_hex.clone();
    h.bulk.put(&nonce_hex, records).await.unwrap();
    h.ledger_tx
        .send(LedgerEvent::DataCommitted {
            patient: PATIENT.to_string(),
            batch_digest: digest,
            encrypted_nonce: sealed,
        })
        .await
        .unwrap();

    let (hospital_db, _) = h.drain().await;
    assert_eq!(
        db::count_verified_records(&hospital_db, HOSPITAL).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn misattributed_record_rejects_the_whole_batch() {
    let h = Harness::start().await;
    h.grant().await;

    let (mut records, digest, sealed) = handcrafted_batch(
        &h,
        &[(MetricType::Heartbeat, 72), (MetricType::Steps, 8000)],
    )
    .await;

    // Attribution fields are outside the tag construction; rewrite one
    // record's patient after the digest was committed. The batch must not
    // land under the forged name, nor at all.
    records[0].patient = "mallory".to_string();

    let nonce_hex = records[0].nonce_hex.clone();
    h.bulk.put(&nonce_hex, records).await.unwrap();
    h.ledger_tx
        .send(LedgerEvent::DataCommitted {
            patient: PATIENT.to_string(),
            batch_digest: digest,
            encrypted_nonce: sealed,
        })
        .await
        .unwrap();

    let (hospital_db, _) = h.drain().await;
    assert_eq!(
        db::count_verified_records(&hospital_db, HOSPITAL).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn record_readdressed_to_another_hospital_rejects_the_batch() {
    let h = Harness::start().await;
    h.grant().await;

    let (mut records, digest, sealed) = handcrafted_batch(&h, &[(MetricType::Steps, 5000)]).await;
    records[0].hospital = "some-other-clinic".to_string();

    let nonce_hex = records[0].nonce_hex.clone();
    h.bulk.put(&nonce_hex, records).await.unwrap();
    h.ledger_tx
        .send(LedgerEvent::DataCommitted {
            patient: PATIENT.to_string(),
            batch_digest: digest,
            encrypted_nonce: sealed,
        })
        .await
        .unwrap();

    let (hospital_db, _) = h.drain().await;
    assert_eq!(
        db::count_verified_records(&hospital_db, HOSPITAL).await.unwrap(),
        0
    );
    assert_eq!(
        db::count_verified_records(&hospital_db, "some-other-clinic")
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn suppressed_record_cannot_pass_the_digest() {
    let h = Harness::start().await;
    h.grant().await;

    let (mut records, digest, sealed) = handcrafted_batch(
        &h,
        &[(MetricType::Heartbeat, 72), (MetricType::Steps, 8000)],
    )
    .await;

    // Drop a record in transit. The received sequence no longer reproduces
    // the committed digest.
    records.pop();

    let nonce_hex = records[0].nonce_hex.clone();
    h.bulk.put(&nonce_hex, records).await.unwrap();
    h.ledger_tx
        .send(LedgerEvent::DataCommitted {
            patient: PATIENT.to_string(),
            batch_digest: digest,
            encrypted_nonce: sealed,
        })
        .await
        .unwrap();

    let (hospital_db, _) = h.drain().await;
    assert_eq!(
        db::count_verified_records(&hospital_db, HOSPITAL).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn replayed_commitment_is_rejected() {
    let h = Harness::start().await;
    h.grant().await;

    let (records, digest, sealed) = handcrafted_batch(&h, &[(MetricType::SugarLevel, 95)]).await;
    let nonce_hex = records[0].nonce_hex.clone();
    h.bulk.put(&nonce_hex, records).await.unwrap();

    let commit = LedgerEvent::DataCommitted {
        patient: PATIENT.to_string(),
        batch_digest: digest,
        encrypted_nonce: sealed,
    };
    h.ledger_tx.send(commit.clone()).await.unwrap();
    h.ledger_tx.send(commit).await.unwrap();

    let (hospital_db, _) = h.drain().await;
    assert_eq!(
        db::count_verified_records(&hospital_db, HOSPITAL).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn commitment_for_a_foreign_key_is_dropped() {
    let h = Harness::start().await;
    h.grant().await;

    let (records, digest, _) = handcrafted_batch(&h, &[(MetricType::Heartbeat, 70)]).await;
    let nonce_hex = records[0].nonce_hex.clone();
    let nonce = hex::decode(&nonce_hex).unwrap();
    h.bulk.put(&nonce_hex, records).await.unwrap();

    // Seal the nonce to a key no identity on the node holds.
    let stranger = transport::TransportKeyPair::generate(&mut OsRng);
    let sealed = transport::seal(&stranger.public(), &nonce, &mut OsRng)
        .unwrap()
        .to_base64();

    h.ledger_tx
        .send(LedgerEvent::DataCommitted {
            patient: PATIENT.to_string(),
            batch_digest: digest,
            encrypted_nonce: sealed,
        })
        .await
        .unwrap();

    let (hospital_db, _) = h.drain().await;
    assert_eq!(
        db::count_verified_records(&hospital_db, HOSPITAL).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn revocation_blocks_later_batches_and_aggregation() {
    let h = Harness::start().await;
    h.grant().await;

    let encoder = h.encoder();
    encoder
        .submit(PATIENT, &BTreeMap::from([(MetricType::Heartbeat, 72)]))
        .await
        .unwrap();

    h.ledger_tx
        .send(LedgerEvent::ConsentRevoked {
            patient: PATIENT.to_string(),
            hospital: HOSPITAL.to_string(),
        })
        .await
        .unwrap();

    // The patient node still holds its edge, so encoding succeeds; the
    // hospital's registry no longer admits the commitment.
    encoder
        .submit(PATIENT, &BTreeMap::from([(MetricType::Heartbeat, 90)]))
        .await
        .unwrap();
    drop(encoder);

    let (hospital_db, hospital_vault) = h.drain().await;
    assert_eq!(
        db::count_verified_records(&hospital_db, HOSPITAL).await.unwrap(),
        1
    );

    // The stored pre-revocation record is now opaque: no pairwise key.
    let engine = AggregationEngine::new(hospital_db, hospital_vault);
    let report = engine.patient_averages(HOSPITAL).await.unwrap();
    assert!(report.patients.is_empty());
    assert_eq!(report.skipped_patients, vec![PATIENT.to_string()]);
}

#[tokio::test]
async fn registry_survives_restart_and_snapshot_corruption() {
    let config = Config::default();
    let hospital_db = memory_db().await;

    let registry = ConsentRegistry::open(hospital_db.clone(), "hospital-node", &config)
        .await
        .unwrap();
    registry.add("alice", HOSPITAL).await.unwrap();
    registry.add("bob", HOSPITAL).await.unwrap();
    drop(registry);

    // Reopen against the same database: the snapshot restores membership.
    let reopened = ConsentRegistry::open(hospital_db.clone(), "hospital-node", &config)
        .await
        .unwrap();
    assert!(reopened.test("alice").await);
    assert!(reopened.test("bob").await);
    assert_eq!(reopened.members().await.unwrap(), vec!["alice", "bob"]);
    drop(reopened);

    // Corrupt the snapshot: the filter is rebuilt from the exact list.
    db::save_filter_snapshot(&hospital_db, "hospital-node", "not a snapshot")
        .await
        .unwrap();
    let rebuilt = ConsentRegistry::open(hospital_db, "hospital-node", &config)
        .await
        .unwrap();
    assert!(rebuilt.test("alice").await);
    assert!(rebuilt.test("bob").await);
    assert!(!rebuilt.test("mallory").await);
}

#[tokio::test]
async fn concurrent_onboarding_settles_on_one_key_set() {
    let db = memory_db().await;
    let vault = Arc::new(KeyVault::new(db, 512));

    let (first, second) = tokio::join!(
        vault.register_identity(HOSPITAL, Role::Hospital),
        vault.register_identity(HOSPITAL, Role::Hospital),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.transport.to_hex(), second.transport.to_hex());
    assert_eq!(
        first.paillier.unwrap().to_hex(),
        second.paillier.unwrap().to_hex()
    );
}

#[tokio::test]
async fn empty_submission_is_rejected_before_any_commitment() {
    let h = Harness::start().await;
    h.grant().await;

    let err = h
        .encoder()
        .submit(PATIENT, &BTreeMap::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no metrics"));
}

#[tokio::test]
async fn submission_without_any_grant_fails() {
    let h = Harness::start().await;

    let err = h
        .encoder()
        .submit(PATIENT, &BTreeMap::from([(MetricType::Steps, 4000)]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("granted no hospitals"));
}
