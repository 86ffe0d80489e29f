pub mod memory;
pub mod sqlite;
pub mod writer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{DedupKey, KeyBasis, QuoteRecord};
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use writer::{LegOutcome, PersistOutcome, QuoteWriter};

/// A persisted observation: the record plus its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub dedup_key: DedupKey,
    pub key_basis: KeyBasis,
    pub record: QuoteRecord,
}

/// Result of one batch insert. `inserted + duplicates` equals the batch size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Read-side summary of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub documents: u64,
    pub latest_observed_at: Option<DateTime<Utc>>,
    /// Documents sharing `latest_observed_at`.
    pub latest_snapshot_documents: u64,
}

/// Document store with a uniqueness constraint on the dedup key.
///
/// Implementations must be safe to call from several symbol tasks at once;
/// every `insert_many` is its own batch.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Declares the unique dedup-key constraint. Re-declaring is a no-op.
    async fn ensure_unique_index(&self, collection: &str) -> Result<(), StoreError>;

    /// Inserts every document whose key is new; existing keys are counted as
    /// duplicates without aborting the batch.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<StoredDocument>,
    ) -> Result<InsertOutcome, StoreError>;

    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats, StoreError>;
}

/// Collection names end up in SQL identifiers, so only `[a-z0-9_]` is
/// accepted.
pub fn validate_collection(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names_are_validated() {
        assert!(validate_collection("nifty_call_option_chain").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("1nifty").is_err());
        assert!(validate_collection("nifty\"; drop table x; --").is_err());
        assert!(validate_collection("NIFTY").is_err());
    }
}
