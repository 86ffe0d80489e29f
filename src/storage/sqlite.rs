use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use super::{validate_collection, CollectionStats, DocumentStore, InsertOutcome, StoredDocument};
use crate::error::StoreError;

struct Inner {
    conn: Connection,
    /// Collections whose table and unique index exist in this database.
    ensured: HashSet<String>,
}

impl Inner {
    fn ensure(&mut self, collection: &str) -> Result<(), StoreError> {
        if self.ensured.contains(collection) {
            return Ok(());
        }
        self.conn.execute_batch(&collection_schema(collection))?;
        self.ensured.insert(collection.to_string());
        Ok(())
    }
}

fn collection_schema(collection: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS "{c}" (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dedup_key TEXT NOT NULL,
    key_basis TEXT NOT NULL,
    symbol TEXT NOT NULL,
    option_type TEXT NOT NULL,
    strike_price REAL NOT NULL,
    expiry_date TEXT,
    observed_at INTEGER NOT NULL,
    document TEXT NOT NULL,
    inserted_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS "{c}_dedup_key" ON "{c}" (dedup_key);
CREATE INDEX IF NOT EXISTS "{c}_observed_at" ON "{c}" (observed_at DESC);
CREATE INDEX IF NOT EXISTS "{c}_strike_expiry" ON "{c}" (strike_price, expiry_date);
"#,
        c = collection
    )
}

/// SQLite-backed document store. One table per collection; the full record
/// is kept as JSON next to the indexed identity columns.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Mutex<Inner>>,
}

impl SqliteStore {
    /// Opens or creates the database file, creating parent directories.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|e| {
            StoreError::Unavailable(format!("cannot open {}: {e}", path.display()))
        })?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        info!(path = %path.display(), "sqlite store opened");
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("cannot open in-memory db: {e}")))?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                conn,
                ensured: HashSet::new(),
            })),
        }
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_inner<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Inner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock();
            f(&mut *guard)
        })
        .await?
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            inner
                .conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn ensure_unique_index(&self, collection: &str) -> Result<(), StoreError> {
        validate_collection(collection)?;
        let collection = collection.to_string();
        self.with_inner(move |inner| {
            inner.ensure(&collection)?;
            debug!(collection = %collection, "unique dedup index ensured");
            Ok(())
        })
        .await
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<StoredDocument>,
    ) -> Result<InsertOutcome, StoreError> {
        validate_collection(collection)?;
        if documents.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let collection = collection.to_string();
        self.with_inner(move |inner| {
            inner.ensure(&collection)?;
            let now = Utc::now().timestamp();
            let mut outcome = InsertOutcome::default();

            let tx = inner.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&format!(
                    r#"INSERT OR IGNORE INTO "{collection}" (
                        dedup_key, key_basis, symbol, option_type, strike_price,
                        expiry_date, observed_at, document, inserted_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#
                ))?;
                for doc in &documents {
                    let record = &doc.record;
                    let document = serde_json::to_string(record)?;
                    let expiry = record.expiry_date.map(|d| d.format("%Y-%m-%d").to_string());
                    let changed = stmt.execute(params![
                        doc.dedup_key.as_str(),
                        doc.key_basis.as_str(),
                        record.symbol,
                        record.option_type.as_str(),
                        record.strike_price,
                        expiry,
                        record.observed_at.timestamp(),
                        document,
                        now,
                    ])?;
                    if changed == 0 {
                        outcome.duplicates += 1;
                    } else {
                        outcome.inserted += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats, StoreError> {
        validate_collection(collection)?;
        let collection = collection.to_string();
        self.with_inner(move |inner| {
            let exists: Option<i64> = inner
                .conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![collection],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(CollectionStats::default());
            }

            let (documents, latest): (i64, Option<i64>) = inner.conn.query_row(
                &format!(r#"SELECT COUNT(*), MAX(observed_at) FROM "{collection}""#),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let latest_snapshot_documents: i64 = match latest {
                Some(at) => inner.conn.query_row(
                    &format!(r#"SELECT COUNT(*) FROM "{collection}" WHERE observed_at = ?1"#),
                    params![at],
                    |row| row.get(0),
                )?,
                None => 0,
            };

            Ok(CollectionStats {
                documents: documents.max(0) as u64,
                latest_observed_at: latest.and_then(|at| DateTime::<Utc>::from_timestamp(at, 0)),
                latest_snapshot_documents: latest_snapshot_documents.max(0) as u64,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{dedup_key, OptionType, QuoteRecord};
    use chrono::{NaiveDate, TimeZone};
    use std::time::Duration;

    fn doc(strike: f64, secs: i64) -> StoredDocument {
        let at = Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap();
        let mut record = QuoteRecord::new("NIFTY", OptionType::Put, strike, at);
        record.expiry_date = NaiveDate::from_ymd_opt(2025, 7, 31);
        record.last_price = Some(12.5);
        let (dedup_key, key_basis) = dedup_key(&record);
        StoredDocument {
            dedup_key,
            key_basis,
            record,
        }
    }

    #[tokio::test]
    async fn test_insert_or_ignore_counts_duplicates() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_unique_index("nifty_put").await.unwrap();

        let batch = vec![doc(24900.0, 0), doc(25000.0, 0), doc(25100.0, 0)];
        let first = store.insert_many("nifty_put", batch.clone()).await.unwrap();
        assert_eq!(first, InsertOutcome { inserted: 3, duplicates: 0 });

        let mut overlapping = batch;
        overlapping.push(doc(25000.0, 5));
        let second = store.insert_many("nifty_put", overlapping).await.unwrap();
        assert_eq!(second, InsertOutcome { inserted: 1, duplicates: 3 });

        let stats = store.collection_stats("nifty_put").await.unwrap();
        assert_eq!(stats.documents, 4);
        assert_eq!(stats.latest_snapshot_documents, 1);
    }

    #[tokio::test]
    async fn test_documents_survive_reopen_and_index_redeclaration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("quotes.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.ensure_unique_index("nifty_put").await.unwrap();
            store
                .insert_many("nifty_put", vec![doc(25000.0, 0), doc(25050.0, 0)])
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        store.ensure_unique_index("nifty_put").await.unwrap();
        let again = store
            .insert_many("nifty_put", vec![doc(25000.0, 0)])
            .await
            .unwrap();
        assert_eq!(again, InsertOutcome { inserted: 0, duplicates: 1 });

        let stats = store.collection_stats("nifty_put").await.unwrap();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.latest_snapshot_documents, 2);
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_insert_still_commits() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_unique_index("nifty_put").await.unwrap();

        let held = store.inner.lock();
        let write = tokio::time::timeout(
            Duration::from_millis(20),
            store.insert_many("nifty_put", vec![doc(25000.0, 0)]),
        )
        .await;
        assert!(write.is_err());
        drop(held);

        let mut documents = 0;
        for _ in 0..100 {
            documents = store.collection_stats("nifty_put").await.unwrap().documents;
            if documents == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(documents, 1);
    }

    #[tokio::test]
    async fn test_missing_collection_reports_empty_stats() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(
            store.collection_stats("nothing_here").await.unwrap(),
            CollectionStats::default()
        );
    }

    #[tokio::test]
    async fn test_invalid_collection_is_rejected_before_sql() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .insert_many("bad\"name", vec![doc(1.0, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidCollection(_)));
    }
}
