use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::data::OptionType;
use crate::error::{CycleError, FailureKind};
use crate::storage::PersistOutcome;

/// Where a symbol's pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStage {
    Idle,
    Fetching,
    Normalizing,
    Persisting,
    CycleFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&CycleError> for CycleFailure {
    fn from(err: &CycleError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Finalized record of one cycle for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub symbol: String,
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records produced by the normalizer.
    pub fetched: usize,
    pub dropped_rows: usize,
    pub unkeyed_dropped: usize,
    pub outcome: PersistOutcome,
    pub error: Option<CycleFailure>,
}

impl CycleReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn accepted(&self) -> usize {
        self.outcome.accepted()
    }

    pub fn rejected(&self) -> usize {
        self.outcome.rejected()
    }
}

/// Running accepted/rejected totals for one leg type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegTotals {
    pub accepted: u64,
    pub rejected: u64,
}

/// Read-only view of one symbol's health, safe to hand to other tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub symbol: String,
    pub stage: CycleStage,
    pub last_success_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub totals_accepted: u64,
    pub totals_rejected: u64,
    pub calls: LegTotals,
    pub puts: LegTotals,
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub success_rate: f64,
    pub dropped_rows: u64,
    pub degraded: bool,
    pub last_error: Option<CycleFailure>,
    /// Most recent cycles, oldest first.
    pub recent: Vec<CycleReport>,
}

/// Aggregate statistics for one symbol. Owned and mutated only by that
/// symbol's task.
pub struct SymbolStats {
    symbol: String,
    total_cycles: u64,
    successful_cycles: u64,
    failed_cycles: u64,
    consecutive_failures: u32,
    last_success_time: Option<DateTime<Utc>>,
    calls: LegTotals,
    puts: LegTotals,
    dropped_rows: u64,
    last_error: Option<CycleFailure>,
    recent: VecDeque<CycleReport>,
    max_recent: usize,
    failure_threshold: u32,
}

impl SymbolStats {
    /// # Arguments
    /// * `max_recent`: cycle reports kept in the rolling window
    /// * `failure_threshold`: consecutive failures that mark the symbol degraded
    pub fn new(symbol: &str, max_recent: usize, failure_threshold: u32) -> Self {
        let max_recent = max_recent.max(1);
        Self {
            symbol: symbol.to_string(),
            total_cycles: 0,
            successful_cycles: 0,
            failed_cycles: 0,
            consecutive_failures: 0,
            last_success_time: None,
            calls: LegTotals::default(),
            puts: LegTotals::default(),
            dropped_rows: 0,
            last_error: None,
            recent: VecDeque::with_capacity(max_recent),
            max_recent,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Number the next cycle will carry.
    pub fn next_cycle(&self) -> u64 {
        self.total_cycles + 1
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.failure_threshold
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_cycles == 0 {
            return 0.0;
        }
        self.successful_cycles as f64 / self.total_cycles as f64
    }

    /// Folds a finished cycle into the aggregate.
    pub fn record(&mut self, report: CycleReport) {
        self.total_cycles += 1;
        self.dropped_rows += report.dropped_rows as u64;

        match &report.error {
            None => {
                self.successful_cycles += 1;
                self.consecutive_failures = 0;
                self.last_success_time = Some(report.finished_at);
                for leg in OptionType::ALL {
                    let outcome = report.outcome.leg(leg);
                    let totals = match leg {
                        OptionType::Call => &mut self.calls,
                        OptionType::Put => &mut self.puts,
                    };
                    totals.accepted += outcome.accepted as u64;
                    totals.rejected += outcome.rejected as u64;
                }
            }
            Some(failure) => {
                self.failed_cycles += 1;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = Some(failure.clone());
            }
        }

        self.recent.push_back(report);
        if self.recent.len() > self.max_recent {
            self.recent.pop_front();
        }
    }

    pub fn snapshot(&self, stage: CycleStage) -> StatusSnapshot {
        StatusSnapshot {
            symbol: self.symbol.clone(),
            stage,
            last_success_time: self.last_success_time,
            consecutive_failures: self.consecutive_failures,
            totals_accepted: self.calls.accepted + self.puts.accepted,
            totals_rejected: self.calls.rejected + self.puts.rejected,
            calls: self.calls,
            puts: self.puts,
            total_cycles: self.total_cycles,
            successful_cycles: self.successful_cycles,
            failed_cycles: self.failed_cycles,
            success_rate: self.success_rate(),
            dropped_rows: self.dropped_rows,
            degraded: self.is_degraded(),
            last_error: self.last_error.clone(),
            recent: self.recent.iter().cloned().collect(),
        }
    }
}

/// Shared, read-mostly slot holding a symbol's latest snapshot. The owning
/// task replaces the whole snapshot, so readers never see a torn value.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl StatusHandle {
    /// # Arguments
    /// * `initial`: snapshot served until the first cycle publishes
    pub fn new(initial: StatusSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Replaces the whole snapshot in one write.
    ///
    /// # Arguments
    /// * `snapshot`: state after the cycle that just finished
    pub fn publish(&self, snapshot: StatusSnapshot) {
        *self.inner.write() = snapshot;
    }

    /// Marks the stage a running cycle has reached; counters are untouched.
    pub fn set_stage(&self, stage: CycleStage) {
        self.inner.write().stage = stage;
    }

    /// # Returns
    /// A copy of the latest snapshot, never a partially published one.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.read().clone()
    }
}
