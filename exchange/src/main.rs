use exchange::aggregate::AggregationEngine;
use exchange::bulk::InMemoryBulkStore;
use exchange::config::Config;
use exchange::consent::ConsentRegistry;
use exchange::db;
use exchange::encoder::SubmissionEncoder;
use exchange::errors::ExchangeError;
use exchange::models::{ConsentEdge, LedgerEvent, MetricType, Role};
use exchange::reactor::EventReactor;
use exchange::vault::KeyVault;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Two-node walkthrough: a patient node grants two hospitals, submits vitals,
/// revokes one hospital, and each hospital aggregates what it can decrypt.
#[tokio::main]
async fn main() -> Result<(), ExchangeError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let config = Config::from_env();

    // Store local state under data (ignored by git).
    let data_dir = PathBuf::from("data");
    std::fs::create_dir_all(&data_dir)
        .map_err(|e| ExchangeError::Setup(format!("create data dir: {e}")))?;

    let patient_db = db::connect(&format!(
        "sqlite:{}",
        data_dir.join("patient-node.sqlite").to_string_lossy()
    ))
    .await?;
    db::init_schema(&patient_db).await?;

    let hospital_db = db::connect(&format!(
        "sqlite:{}",
        data_dir.join("hospital-node.sqlite").to_string_lossy()
    ))
    .await?;
    db::init_schema(&hospital_db).await?;

    // Both nodes share one bulk channel and one event queue in-process.
    let bulk = Arc::new(InMemoryBulkStore::new());
    let (ledger_tx, ledger_rx) = mpsc::channel::<LedgerEvent>(64);

    // Hospital node: onboard two hospital identities and start the reactor.
    let hospital_vault = Arc::new(KeyVault::new(hospital_db.clone(), config.paillier_bits));
    let general = hospital_vault
        .register_identity("general-hospital", Role::Hospital)
        .await?;
    let county = hospital_vault
        .register_identity("county-clinic", Role::Hospital)
        .await?;

    let registry = Arc::new(ConsentRegistry::open(hospital_db.clone(), "hospital-node", &config).await?);
    let reactor = EventReactor::new(
        hospital_db.clone(),
        hospital_vault.clone(),
        registry.clone(),
        bulk.clone(),
        &config,
    );
    let reactor_handle = tokio::spawn(reactor.run(ledger_rx));

    // Patient node: onboard and grant both hospitals.
    let patient_vault = Arc::new(KeyVault::new(patient_db.clone(), config.paillier_bits));
    patient_vault.register_identity("alice", Role::Patient).await?;

    for (hospital, keys) in [("general-hospital", &general), ("county-clinic", &county)] {
        let paillier_public = keys.paillier.clone().ok_or_else(|| {
            ExchangeError::Setup(format!("{hospital} published no homomorphic key"))
        })?;

        let encrypted_key = patient_vault
            .establish_pairwise_key("alice", hospital, &keys.transport)
            .await?;
        db::upsert_consent_edge(
            &patient_db,
            "alice",
            &ConsentEdge {
                hospital: hospital.to_string(),
                transport_public: keys.transport,
                paillier_public,
            },
        )
        .await?;

        publish(
            &ledger_tx,
            LedgerEvent::ConsentGranted {
                patient: "alice".to_string(),
                hospital: hospital.to_string(),
                encrypted_key,
            },
        )
        .await?;
    }

    // Submit vitals twice; the second batch only carries a sugar reading.
    let encoder = SubmissionEncoder::new(
        patient_db.clone(),
        patient_vault.clone(),
        bulk.clone(),
        ledger_tx.clone(),
    );

    let first: BTreeMap<MetricType, u64> = BTreeMap::from([
        (MetricType::Heartbeat, 72),
        (MetricType::Steps, 8000),
        (MetricType::SugarLevel, 90),
    ]);
    let outcome = encoder.submit("alice", &first).await?;
    tracing::info!(submission = %outcome.submission_id, hospitals = outcome.committed.len(), "first batch committed");

    let second = BTreeMap::from([(MetricType::SugarLevel, 110)]);
    let outcome = encoder.submit("alice", &second).await?;
    tracing::info!(submission = %outcome.submission_id, hospitals = outcome.committed.len(), "second batch committed");

    // Revoke the clinic. Its stored ciphertexts become permanently opaque.
    db::remove_consent_edge(&patient_db, "alice", "county-clinic").await?;
    patient_vault.revoke_pairwise_key("alice", "county-clinic").await?;
    publish(
        &ledger_tx,
        LedgerEvent::ConsentRevoked {
            patient: "alice".to_string(),
            hospital: "county-clinic".to_string(),
        },
    )
    .await?;

    // Close the queue and let the reactor drain it.
    drop(encoder);
    drop(ledger_tx);
    reactor_handle
        .await
        .map_err(|e| ExchangeError::Setup(format!("reactor task: {e}")))?;

    let engine = AggregationEngine::new(hospital_db.clone(), hospital_vault.clone());
    for hospital in ["general-hospital", "county-clinic"] {
        let report = engine.patient_averages(hospital).await?;
        let rendered = serde_json::to_string_pretty(&report)
            .map_err(|e| ExchangeError::Setup(format!("render report: {e}")))?;
        println!("{rendered}");
    }

    Ok(())
}

async fn publish(
    tx: &mpsc::Sender<LedgerEvent>,
    event: LedgerEvent,
) -> Result<(), ExchangeError> {
    tx.send(event)
        .await
        .map_err(|e| ExchangeError::Transport(format!("event queue closed: {e}")))
}
