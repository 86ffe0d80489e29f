use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{validate_collection, CollectionStats, DocumentStore, InsertOutcome, StoredDocument};
use crate::data::DedupKey;
use crate::error::StoreError;

#[derive(Default)]
struct Collection {
    keys: HashSet<DedupKey>,
    documents: Vec<StoredDocument>,
}

/// Volatile store for dry runs and tests. Uniqueness is enforced on every
/// collection.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self, collection: &str) -> Vec<StoredDocument> {
        self.collections
            .lock()
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ensure_unique_index(&self, collection: &str) -> Result<(), StoreError> {
        validate_collection(collection)?;
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<StoredDocument>,
    ) -> Result<InsertOutcome, StoreError> {
        validate_collection(collection)?;
        let mut guard = self.collections.lock();
        let target = guard.entry(collection.to_string()).or_default();

        let mut outcome = InsertOutcome::default();
        for doc in documents {
            if target.keys.insert(doc.dedup_key.clone()) {
                target.documents.push(doc);
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        Ok(outcome)
    }

    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats, StoreError> {
        validate_collection(collection)?;
        let guard = self.collections.lock();
        let Some(target) = guard.get(collection) else {
            return Ok(CollectionStats::default());
        };
        let latest = target.documents.iter().map(|d| d.record.observed_at).max();
        let latest_snapshot_documents = latest
            .map(|at| {
                target
                    .documents
                    .iter()
                    .filter(|d| d.record.observed_at == at)
                    .count() as u64
            })
            .unwrap_or(0);
        Ok(CollectionStats {
            documents: target.documents.len() as u64,
            latest_observed_at: latest,
            latest_snapshot_documents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{dedup_key, OptionType, QuoteRecord};
    use chrono::{TimeZone, Utc};

    fn doc(strike: f64, secs: i64) -> StoredDocument {
        let at = Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap();
        let record = QuoteRecord::new("NIFTY", OptionType::Call, strike, at);
        let (dedup_key, key_basis) = dedup_key(&record);
        StoredDocument {
            dedup_key,
            key_basis,
            record,
        }
    }

    #[tokio::test]
    async fn test_duplicates_within_and_across_batches_are_counted() {
        let store = MemoryStore::new();
        store.ensure_unique_index("c").await.unwrap();

        let first = store
            .insert_many("c", vec![doc(1.0, 0), doc(2.0, 0), doc(1.0, 0)])
            .await
            .unwrap();
        assert_eq!(first, InsertOutcome { inserted: 2, duplicates: 1 });

        let second = store.insert_many("c", vec![doc(2.0, 0), doc(3.0, 5)]).await.unwrap();
        assert_eq!(second, InsertOutcome { inserted: 1, duplicates: 1 });

        let stats = store.collection_stats("c").await.unwrap();
        assert_eq!(stats.documents, 3);
        assert_eq!(stats.latest_snapshot_documents, 1);
        assert_eq!(stats.latest_observed_at, Some(Utc.timestamp_opt(1_750_000_005, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_ensure_unique_index_is_idempotent() {
        let store = MemoryStore::new();
        store.ensure_unique_index("c").await.unwrap();
        store.insert_many("c", vec![doc(1.0, 0)]).await.unwrap();
        store.ensure_unique_index("c").await.unwrap();
        assert_eq!(store.documents("c").len(), 1);
        assert_eq!(store.collection_names(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_collection_has_empty_stats() {
        let store = MemoryStore::new();
        assert_eq!(
            store.collection_stats("missing").await.unwrap(),
            CollectionStats::default()
        );
    }
}
