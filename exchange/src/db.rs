use crate::errors::{ExchangeError, Result};
use crate::models::{ConsentEdge, HealthRecord, now_rfc3339};
use he_crypto::paillier::PaillierPublicKey;
use he_crypto::transport::TransportPublicKey;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

pub type Db = Pool<Sqlite>;

pub async fn connect(db_url: &str) -> Result<Db> {
    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(ExchangeError::Storage)?
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(ExchangeError::Storage)
}

pub async fn init_schema(db: &Db) -> Result<()> {
    // NOTE: Keep schema minimal and explicit. Verified records are append-only;
    // everything else is small keyed state.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS consent_edges (
  patient TEXT NOT NULL,
  hospital TEXT NOT NULL,
  transport_public_hex TEXT NOT NULL,
  paillier_n_hex TEXT NOT NULL,
  paillier_g_hex TEXT NOT NULL,
  granted_at TEXT NOT NULL,
  PRIMARY KEY(patient, hospital)
);

CREATE TABLE IF NOT EXISTS consented_patients (
  hospital TEXT NOT NULL,
  patient TEXT NOT NULL,
  granted_at TEXT NOT NULL,
  PRIMARY KEY(hospital, patient)
);

CREATE TABLE IF NOT EXISTS pairwise_keys (
  edge_hash TEXT PRIMARY KEY,
  key_hex TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS verified_records (
  integrity_tag TEXT PRIMARY KEY,
  classification_tag TEXT NOT NULL,
  patient TEXT NOT NULL,
  hospital TEXT NOT NULL,
  ciphertext_hex TEXT NOT NULL,
  nonce_hex TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  received_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_verified_classification
  ON verified_records(classification_tag);
CREATE INDEX IF NOT EXISTS idx_verified_patient
  ON verified_records(hospital, patient);

CREATE TABLE IF NOT EXISTS filter_snapshots (
  node_id TEXT PRIMARY KEY,
  snapshot_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#,
    )
    .execute(db)
    .await?;

    Ok(())
}

// ---- patient-side consent list -------------------------------------------

pub async fn upsert_consent_edge(db: &Db, patient: &str, edge: &ConsentEdge) -> Result<()> {
    let (n_hex, g_hex) = edge.paillier_public.to_hex();

    sqlx::query(
        r#"INSERT OR REPLACE INTO consent_edges
           (patient, hospital, transport_public_hex, paillier_n_hex, paillier_g_hex, granted_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(patient)
    .bind(&edge.hospital)
    .bind(edge.transport_public.to_hex())
    .bind(n_hex)
    .bind(g_hex)
    .bind(now_rfc3339())
    .execute(db)
    .await?;

    Ok(())
}

pub async fn remove_consent_edge(db: &Db, patient: &str, hospital: &str) -> Result<()> {
    sqlx::query(r#"DELETE FROM consent_edges WHERE patient = ? AND hospital = ?"#)
        .bind(patient)
        .bind(hospital)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn list_consent_edges(db: &Db, patient: &str) -> Result<Vec<ConsentEdge>> {
    let rows = sqlx::query(
        r#"SELECT hospital, transport_public_hex, paillier_n_hex, paillier_g_hex
           FROM consent_edges WHERE patient = ? ORDER BY hospital"#,
    )
    .bind(patient)
    .fetch_all(db)
    .await?;

    let mut edges = Vec::with_capacity(rows.len());
    for row in rows {
        let hospital: String = row.get(0);
        let transport_hex: String = row.get(1);
        let n_hex: String = row.get(2);
        let g_hex: String = row.get(3);

        edges.push(ConsentEdge {
            hospital,
            transport_public: TransportPublicKey::from_hex(&transport_hex)?,
            paillier_public: PaillierPublicKey::from_hex(&n_hex, &g_hex)?,
        });
    }

    Ok(edges)
}

// ---- hospital-side exact consent list ------------------------------------

pub async fn add_consented_patient(db: &Db, hospital: &str, patient: &str) -> Result<()> {
    sqlx::query(
        r#"INSERT OR IGNORE INTO consented_patients (hospital, patient, granted_at)
           VALUES (?, ?, ?)"#,
    )
    .bind(hospital)
    .bind(patient)
    .bind(now_rfc3339())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn remove_consented_patient(db: &Db, hospital: &str, patient: &str) -> Result<()> {
    sqlx::query(r#"DELETE FROM consented_patients WHERE hospital = ? AND patient = ?"#)
        .bind(hospital)
        .bind(patient)
        .execute(db)
        .await?;
    Ok(())
}

/// Distinct patients holding at least one live edge on this node, the
/// source of truth the permission filter is rebuilt from.
pub async fn list_consented_patients(db: &Db) -> Result<Vec<String>> {
    let rows = sqlx::query(r#"SELECT DISTINCT patient FROM consented_patients ORDER BY patient"#)
        .fetch_all(db)
        .await?;

    Ok(rows.iter().map(|r| r.get(0)).collect())
}

// ---- pairwise keys --------------------------------------------------------

pub async fn upsert_pairwise_key(db: &Db, edge_hash: &str, key_hex: &str) -> Result<()> {
    sqlx::query(
        r#"INSERT OR REPLACE INTO pairwise_keys (edge_hash, key_hex, created_at)
           VALUES (?, ?, ?)"#,
    )
    .bind(edge_hash)
    .bind(key_hex)
    .bind(now_rfc3339())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get_pairwise_key(db: &Db, edge_hash: &str) -> Result<Option<String>> {
    let row = sqlx::query(r#"SELECT key_hex FROM pairwise_keys WHERE edge_hash = ?"#)
        .bind(edge_hash)
        .fetch_optional(db)
        .await?;

    Ok(row.map(|r| r.get(0)))
}

pub async fn delete_pairwise_key(db: &Db, edge_hash: &str) -> Result<()> {
    sqlx::query(r#"DELETE FROM pairwise_keys WHERE edge_hash = ?"#)
        .bind(edge_hash)
        .execute(db)
        .await?;
    Ok(())
}

// ---- verified records -----------------------------------------------------

pub async fn integrity_tag_exists(db: &Db, integrity_tag: &str) -> Result<bool> {
    let row = sqlx::query(r#"SELECT COUNT(*) AS c FROM verified_records WHERE integrity_tag = ?"#)
        .bind(integrity_tag)
        .fetch_one(db)
        .await?;
    let c: i64 = row.get("c");
    Ok(c > 0)
}

/// Persist a fully verified batch atomically. The primary key on
/// `integrity_tag` backstops the reactor's replay check.
pub async fn insert_verified_records(db: &Db, records: &[HealthRecord]) -> Result<()> {
    let received_at = now_rfc3339();
    let mut tx = db.begin().await?;

    for r in records {
        sqlx::query(
            r#"INSERT INTO verified_records
               (integrity_tag, classification_tag, patient, hospital,
                ciphertext_hex, nonce_hex, timestamp, received_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&r.integrity_tag)
        .bind(&r.classification_tag)
        .bind(&r.patient)
        .bind(&r.hospital)
        .bind(&r.ciphertext_hex)
        .bind(&r.nonce_hex)
        .bind(&r.timestamp)
        .bind(&received_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Point-in-time snapshot of a hospital's verified records.
pub async fn list_verified_records(db: &Db, hospital: &str) -> Result<Vec<HealthRecord>> {
    let rows = sqlx::query(
        r#"SELECT patient, hospital, ciphertext_hex, nonce_hex, timestamp,
                  classification_tag, integrity_tag
           FROM verified_records
           WHERE hospital = ?
           ORDER BY received_at, integrity_tag"#,
    )
    .bind(hospital)
    .fetch_all(db)
    .await?;

    Ok(rows
        .iter()
        .map(|row| HealthRecord {
            patient: row.get(0),
            hospital: row.get(1),
            ciphertext_hex: row.get(2),
            nonce_hex: row.get(3),
            timestamp: row.get(4),
            classification_tag: row.get(5),
            integrity_tag: row.get(6),
        })
        .collect())
}

pub async fn count_verified_records(db: &Db, hospital: &str) -> Result<u64> {
    let row = sqlx::query(r#"SELECT COUNT(*) AS c FROM verified_records WHERE hospital = ?"#)
        .bind(hospital)
        .fetch_one(db)
        .await?;
    let c: i64 = row.get("c");
    Ok(c as u64)
}

// ---- filter snapshot ------------------------------------------------------

pub async fn save_filter_snapshot(db: &Db, node_id: &str, snapshot_json: &str) -> Result<()> {
    sqlx::query(
        r#"INSERT OR REPLACE INTO filter_snapshots (node_id, snapshot_json, updated_at)
           VALUES (?, ?, ?)"#,
    )
    .bind(node_id)
    .bind(snapshot_json)
    .bind(now_rfc3339())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn load_filter_snapshot(db: &Db, node_id: &str) -> Result<Option<String>> {
    let row = sqlx::query(r#"SELECT snapshot_json FROM filter_snapshots WHERE node_id = ?"#)
        .bind(node_id)
        .fetch_optional(db)
        .await?;

    Ok(row.map(|r| r.get(0)))
}
