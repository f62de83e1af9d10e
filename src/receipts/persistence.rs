//! Receipt persistence contract.
//!
//! The document-store driver itself lives outside this crate; the bridge
//! consumes this capability set and ships an in-memory implementation.

use async_trait::async_trait;
use thiserror::Error;

use super::Document;

/// Query parameters for a receipt listing.
#[derive(Debug, Clone, Default)]
pub struct ReceiptQuery {
    pub skip: usize,
    /// 0 means no caller-imposed limit (still bounded by the store's
    /// configured query limit at the REST layer)
    pub limit: usize,
    pub ids: Vec<String>,
    /// Only receipts with `receivedAt` at or after this epoch-millis value
    pub since_ms: i64,
    pub from: Option<String>,
    pub to: Option<String>,
    pub start: Option<String>,
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Insert with `overwrite == false` hit an existing document
    #[error("receipt ID is not unique")]
    KeyNotUnique,

    /// Store-side failure that may clear on retry
    #[error("transient persistence error: {0}")]
    Transient(String),

    /// Plain-message failure (e.g. unsupported query shape)
    #[error("{0}")]
    Other(String),
}

/// Capability set for the receipt store's persistence tier.
#[async_trait]
pub trait ReceiptPersistence: Send + Sync {
    /// Fetch a single receipt; `Ok(None)` when absent.
    async fn get_receipt(&self, id: &str) -> Result<Option<Document>, PersistenceError>;

    /// List receipts. Must return an empty vector (never an error) when
    /// nothing matches.
    async fn get_receipts(&self, query: &ReceiptQuery) -> Result<Vec<Document>, PersistenceError>;

    /// Insert a receipt. With `overwrite == false` an existing document with
    /// the same id fails with [`PersistenceError::KeyNotUnique`]; with
    /// `overwrite == true` the write is unconditional.
    async fn add_receipt(
        &self,
        id: &str,
        receipt: Document,
        overwrite: bool,
    ) -> Result<(), PersistenceError>;
}
