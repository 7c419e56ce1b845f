//! Consent registry: exact durable list + derived probabilistic filter.
//!
//! The exact list (SQLite, one row per live (hospital, patient) edge) is the
//! source of truth. The bloom filter over distinct granting patients is a
//! rebuildable cache: filters cannot delete, so every revocation rebuilds it
//! from the list. Revocation is rare relative to reads, so the O(|list|)
//! rebuild is an accepted cost.

use crate::config::Config;
use crate::db::{self, Db};
use crate::errors::{ExchangeError, Result};
use crate::filter::PermissionFilter;
use crate::models::normalize_identity;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct ConsentRegistry {
    db: Db,
    node_id: String,
    capacity: usize,
    error_rate: f64,
    seed: u64,
    filter: RwLock<PermissionFilter>,
}

impl ConsentRegistry {
    /// Open the registry for a node: restore the cached filter snapshot if
    /// one exists, otherwise rebuild from the exact list.
    pub async fn open(db: Db, node_id: &str, config: &Config) -> Result<Self> {
        let seed = 0x6578_6368_616e_6765; // stable across restarts; snapshots stay valid

        let filter = match db::load_filter_snapshot(&db, node_id).await? {
            Some(json) => match serde_json::from_str::<PermissionFilter>(&json) {
                Ok(filter) => {
                    debug!(node_id, "restored permission filter snapshot");
                    filter
                }
                Err(e) => {
                    info!(node_id, error = %e, "filter snapshot unreadable, rebuilding");
                    rebuild_filter(&db, config.filter_capacity, config.filter_error_rate, seed)
                        .await?
                }
            },
            None => {
                rebuild_filter(&db, config.filter_capacity, config.filter_error_rate, seed).await?
            }
        };

        let registry = Self {
            db,
            node_id: node_id.to_string(),
            capacity: config.filter_capacity,
            error_rate: config.filter_error_rate,
            seed,
            filter: RwLock::new(filter),
        };
        registry.persist_snapshot().await?;
        Ok(registry)
    }

    /// Record a grant edge. Idempotent in both the list and the filter.
    pub async fn add(&self, patient: &str, hospital: &str) -> Result<()> {
        let patient = normalize_identity(patient);
        let hospital = normalize_identity(hospital);

        db::add_consented_patient(&self.db, &hospital, &patient).await?;
        self.filter.write().await.insert(&patient);
        self.persist_snapshot().await?;

        info!(%patient, %hospital, "patient added to consent registry");
        Ok(())
    }

    /// Remove a grant edge, then rebuild the filter from the surviving exact
    /// list. A patient stays in the filter while any other edge is live.
    pub async fn remove(&self, patient: &str, hospital: &str) -> Result<()> {
        let patient = normalize_identity(patient);
        let hospital = normalize_identity(hospital);

        db::remove_consented_patient(&self.db, &hospital, &patient).await?;

        let rebuilt = rebuild_filter(&self.db, self.capacity, self.error_rate, self.seed).await?;
        *self.filter.write().await = rebuilt;
        self.persist_snapshot().await?;

        info!(%patient, %hospital, "patient removed; permission filter rebuilt");
        Ok(())
    }

    /// Membership hint. May be a false positive; never a false negative.
    /// Callers proceed to exact verification (authenticated nonce decryption).
    pub async fn test(&self, patient: &str) -> bool {
        self.filter
            .read()
            .await
            .contains(&normalize_identity(patient))
    }

    /// The exact list: distinct patients with at least one live edge.
    pub async fn members(&self) -> Result<Vec<String>> {
        db::list_consented_patients(&self.db).await
    }

    async fn persist_snapshot(&self) -> Result<()> {
        let json = {
            let filter = self.filter.read().await;
            serde_json::to_string(&*filter)
                .map_err(|e| ExchangeError::Setup(format!("serialize filter snapshot: {e}")))?
        };
        db::save_filter_snapshot(&self.db, &self.node_id, &json).await
    }
}

async fn rebuild_filter(
    db: &Db,
    capacity: usize,
    error_rate: f64,
    seed: u64,
) -> Result<PermissionFilter> {
    let members = db::list_consented_patients(db).await?;
    let mut filter = PermissionFilter::new(capacity, error_rate, seed);
    for patient in &members {
        filter.insert(patient);
    }
    debug!(members = members.len(), "permission filter rebuilt from exact list");
    Ok(filter)
}
