use thiserror::Error;

/// Failure taxonomy for the exchange.
///
/// Record- and edge-level errors are recovered where they occur and never
/// interrupt other hospitals, batches, or metrics. Integrity violations are
/// fatal to the affected batch only. Setup failures surface to the caller.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// No pairwise key exists for a (patient, hospital) edge.
    #[error("no pairwise key for edge {patient} -> {hospital}")]
    Consent { patient: String, hospital: String },

    #[error(transparent)]
    Crypto(#[from] he_crypto::CryptoError),

    /// Tag or digest mismatch; the whole batch is rejected.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Bulk-channel failure after retries.
    #[error("bulk transport failure: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Onboarding or key-generation failure; non-recoverable for the request.
    #[error("setup failure: {0}")]
    Setup(String),
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
