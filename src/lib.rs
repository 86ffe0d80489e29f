//! Option-chain quote ingestion: fetch, normalize, dedup-key and persist
//! provider snapshots on a per-symbol schedule.

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod storage;
