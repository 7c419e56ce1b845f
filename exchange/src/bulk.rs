//! Bulk channel port.
//!
//! Records never touch the ledger; they travel through an off-chain bulk
//! store, retrievable by the batch nonce that the ledger commitment seals to
//! the receiving hospital. The store is append-only. Fetches are treated as
//! retryable network calls: the reactor wraps them in a bounded timeout and
//! a bounded retry count, and a permanent failure drops that batch without
//! taking down the event loop.

use crate::errors::{ExchangeError, Result};
use crate::models::HealthRecord;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

pub trait BulkChannel: Send + Sync + 'static {
    /// Publish a batch under its nonce. Append-only: re-publishing a nonce
    /// is an error.
    fn put(
        &self,
        nonce_hex: &str,
        records: Vec<HealthRecord>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Fetch a batch by nonce, in the order it was published.
    fn fetch_by_nonce(
        &self,
        nonce_hex: &str,
    ) -> impl Future<Output = Result<Vec<HealthRecord>>> + Send;
}

/// Fetch with a per-attempt timeout and bounded retries.
pub async fn fetch_with_retry<B: BulkChannel>(
    bulk: &B,
    nonce_hex: &str,
    timeout: Duration,
    retries: u32,
) -> Result<Vec<HealthRecord>> {
    let mut last_error = String::new();

    for attempt in 0..=retries {
        match tokio::time::timeout(timeout, bulk.fetch_by_nonce(nonce_hex)).await {
            Ok(Ok(records)) => return Ok(records),
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("fetch timed out after {timeout:?}"),
        }

        if attempt < retries {
            warn!(attempt, error = %last_error, "bulk fetch failed, retrying");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    Err(ExchangeError::Transport(format!(
        "bulk fetch failed after {} attempts: {last_error}",
        retries + 1
    )))
}

/// In-memory bulk store used by the demo and the test suite.
#[derive(Clone, Default)]
pub struct InMemoryBulkStore {
    batches: Arc<RwLock<HashMap<String, Vec<HealthRecord>>>>,
}

impl InMemoryBulkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BulkChannel for InMemoryBulkStore {
    async fn put(&self, nonce_hex: &str, records: Vec<HealthRecord>) -> Result<()> {
        let mut batches = self.batches.write().await;
        if batches.contains_key(nonce_hex) {
            return Err(ExchangeError::Transport(format!(
                "batch for nonce {nonce_hex} already published"
            )));
        }
        batches.insert(nonce_hex.to_string(), records);
        Ok(())
    }

    async fn fetch_by_nonce(&self, nonce_hex: &str) -> Result<Vec<HealthRecord>> {
        self.batches
            .read()
            .await
            .get(nonce_hex)
            .cloned()
            .ok_or_else(|| ExchangeError::Transport(format!("no records for nonce {nonce_hex}")))
    }
}
