pub mod dedup;
pub mod ingestion;
pub mod models;
pub mod processing;
pub mod retry;

pub use dedup::{dedup_key, DedupKey, KeyBasis};
pub use ingestion::{FetchClient, ProviderSession, QuoteSource};
pub use models::{OptionType, QuoteRecord, RawPayload};
pub use processing::{NormalizedBatch, RecordNormalizer};
pub use retry::RetryPolicy;
