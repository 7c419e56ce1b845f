//! Consent-gated encrypted exchange of vital-sign data.
//!
//! A patient shares homomorphically encrypted measurements with multiple
//! independently operated hospitals. Consent is revocable and
//! cryptographically enforced; bulk transfers are anchored by an O(1)
//! hash commitment on an append-only ledger; hospitals compute per-patient
//! averages without decrypting individual readings.
//!
//! Component map:
//! - [`consent`]: revocable probabilistic membership over granting patients.
//! - [`vault`]: identity key pairs and pairwise symmetric keys.
//! - [`encoder`]: patient-side batch encryption and commitment.
//! - [`reactor`]: hospital-side ledger-event state machine and integrity
//!   verification of fetched batches.
//! - [`aggregate`]: classification, homomorphic summing, decrypt-once stats.
//!
//! The HTTP surface, the ledger itself, and document storage internals are
//! external collaborators; they appear here only as the typed event queue,
//! the [`bulk::BulkChannel`] port, and the SQLite-backed durable state.

pub mod aggregate;
pub mod bulk;
pub mod config;
pub mod consent;
pub mod db;
pub mod encoder;
pub mod errors;
pub mod filter;
pub mod models;
pub mod reactor;
pub mod vault;
