use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{CollectionStats, DocumentStore, StoredDocument};
use crate::config::StoreConfig;
use crate::data::{dedup_key, OptionType, QuoteRecord};
use crate::error::StoreError;

/// Accepted/rejected counts for one leg type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegOutcome {
    pub accepted: usize,
    pub rejected: usize,
}

/// Outcome of persisting one batch. Accepted plus rejected always equals
/// the number of records handed to [`QuoteWriter::persist`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistOutcome {
    pub calls: LegOutcome,
    pub puts: LegOutcome,
}

impl PersistOutcome {
    pub fn leg(&self, leg: OptionType) -> LegOutcome {
        match leg {
            OptionType::Call => self.calls,
            OptionType::Put => self.puts,
        }
    }

    fn leg_mut(&mut self, leg: OptionType) -> &mut LegOutcome {
        match leg {
            OptionType::Call => &mut self.calls,
            OptionType::Put => &mut self.puts,
        }
    }

    pub fn accepted(&self) -> usize {
        self.calls.accepted + self.puts.accepted
    }

    pub fn rejected(&self) -> usize {
        self.calls.rejected + self.puts.rejected
    }
}

/// Writes normalized records into one collection per symbol and leg type.
#[derive(Clone)]
pub struct QuoteWriter {
    store: Arc<dyn DocumentStore>,
    config: StoreConfig,
}

impl QuoteWriter {
    /// # Arguments
    /// * `store`: backend shared by every symbol
    /// * `config`: collection naming for symbols and legs
    ///
    /// # Returns
    /// A writer that can be cloned into each symbol's pipeline.
    pub fn new(store: Arc<dyn DocumentStore>, config: StoreConfig) -> Self {
        Self { store, config }
    }

    pub fn collection_for(&self, symbol: &str, leg: OptionType) -> String {
        self.config.collection_for(symbol, leg)
    }

    /// Declares the unique dedup index on every collection the symbols
    /// will write to. Safe to call on every start.
    pub async fn ensure_collections(&self, symbols: &[String]) -> Result<(), StoreError> {
        self.store.ping().await?;
        for symbol in symbols {
            for leg in OptionType::ALL {
                let collection = self.collection_for(symbol, leg);
                self.store.ensure_unique_index(&collection).await?;
                debug!(symbol = %symbol, collection = %collection, "collection ready");
            }
        }
        info!(symbols = symbols.len(), "dedup indexes declared");
        Ok(())
    }

    /// Persists `batch`, one `insert_many` per (symbol, leg) group.
    ///
    /// # Arguments
    ///
    /// * `batch` - Records of one cycle; usually a single symbol.
    ///
    /// # Returns
    ///
    /// Per-leg accepted and rejected counts. Existing keys are rejections,
    /// not errors; a `StoreError` means the store itself failed and groups
    /// not yet written are abandoned.
    pub async fn persist(&self, batch: &[QuoteRecord]) -> Result<PersistOutcome, StoreError> {
        let mut groups: BTreeMap<(String, OptionType), Vec<StoredDocument>> = BTreeMap::new();
        for record in batch {
            let (key, basis) = dedup_key(record);
            groups
                .entry((record.symbol.clone(), record.option_type))
                .or_default()
                .push(StoredDocument {
                    dedup_key: key,
                    key_basis: basis,
                    record: record.clone(),
                });
        }

        let mut outcome = PersistOutcome::default();
        for ((symbol, leg), documents) in groups {
            let collection = self.collection_for(&symbol, leg);
            let submitted = documents.len();
            let inserted = self.store.insert_many(&collection, documents).await?;

            // Anything not inserted was a duplicate key.
            let accepted = inserted.inserted.min(submitted);
            let slot = outcome.leg_mut(leg);
            slot.accepted += accepted;
            slot.rejected += submitted - accepted;

            debug!(
                collection = %collection,
                submitted,
                accepted,
                rejected = submitted - accepted,
                "batch persisted"
            );
        }
        Ok(outcome)
    }

    /// Store statistics for both legs of `symbol`.
    pub async fn symbol_stats(
        &self,
        symbol: &str,
    ) -> Result<Vec<(OptionType, CollectionStats)>, StoreError> {
        let mut stats = Vec::with_capacity(OptionType::ALL.len());
        for leg in OptionType::ALL {
            let collection = self.collection_for(symbol, leg);
            stats.push((leg, self.store.collection_stats(&collection).await?));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, SqliteStore};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn batch(n: usize) -> Vec<QuoteRecord> {
        let at = Utc.with_ymd_and_hms(2025, 7, 17, 9, 15, 0).unwrap();
        (0..n)
            .map(|i| {
                let leg = if i % 2 == 0 { OptionType::Call } else { OptionType::Put };
                let mut r = QuoteRecord::new("NIFTY", leg, 24000.0 + (i / 2) as f64 * 50.0, at);
                r.expiry_date = NaiveDate::from_ymd_opt(2025, 7, 31);
                r.open_interest = Some(100.0 + i as f64);
                r
            })
            .collect()
    }

    async fn assert_idempotent(store: Arc<dyn DocumentStore>) {
        let writer = QuoteWriter::new(store, StoreConfig::default());
        writer.ensure_collections(&["NIFTY".to_string()]).await.unwrap();
        let records = batch(10);

        let first = writer.persist(&records).await.unwrap();
        assert_eq!((first.accepted(), first.rejected()), (10, 0));
        assert_eq!(first.calls, LegOutcome { accepted: 5, rejected: 0 });

        let second = writer.persist(&records).await.unwrap();
        assert_eq!((second.accepted(), second.rejected()), (0, 10));
        assert_eq!(second.leg(OptionType::Put), LegOutcome { accepted: 0, rejected: 5 });
    }

    #[tokio::test]
    async fn test_persisting_twice_is_idempotent_in_memory() {
        assert_idempotent(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_persisting_twice_is_idempotent_in_sqlite() {
        assert_idempotent(Arc::new(SqliteStore::open_in_memory().unwrap())).await;
    }

    #[tokio::test]
    async fn test_partial_overlap_is_reported_precisely() {
        let store = Arc::new(MemoryStore::new());
        let writer = QuoteWriter::new(store.clone(), StoreConfig::default());
        let records = batch(6);

        writer.persist(&records[..4]).await.unwrap();
        let outcome = writer.persist(&records).await.unwrap();
        assert_eq!(outcome.accepted(), 2);
        assert_eq!(outcome.rejected(), 4);
        assert_eq!(store.documents("nifty_call_option_chain").len(), 3);
        assert_eq!(store.documents("nifty_put_option_chain").len(), 3);
    }

    #[tokio::test]
    async fn test_symbol_stats_cover_both_legs() {
        let writer = QuoteWriter::new(Arc::new(MemoryStore::new()), StoreConfig::default());
        writer.persist(&batch(4)).await.unwrap();
        let stats = writer.symbol_stats("NIFTY").await.unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|(_, s)| s.documents == 2 && s.latest_snapshot_documents == 2));
    }

    #[tokio::test]
    async fn test_empty_batch_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let writer = QuoteWriter::new(store.clone(), StoreConfig::default());
        assert_eq!(writer.persist(&[]).await.unwrap(), PersistOutcome::default());
        assert!(store.collection_names().is_empty());
    }
}
