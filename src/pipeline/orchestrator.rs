use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stats::{CycleFailure, CycleReport, CycleStage, StatusHandle, StatusSnapshot, SymbolStats};
use crate::config::{PipelineConfig, ScheduleConfig};
use crate::data::{FetchClient, QuoteSource, RecordNormalizer, RetryPolicy};
use crate::error::{CycleError, TriggerError};
use crate::storage::{PersistOutcome, QuoteWriter};

type CycleRequest = oneshot::Sender<CycleReport>;

/// Pending on-demand cycles per symbol.
const TRIGGER_QUEUE: usize = 8;

/// Everything one symbol needs to run its cycles. Owned by that symbol's
/// task; nothing in here is shared with other symbols except the store.
struct SymbolPipeline {
    symbol: String,
    fetcher: FetchClient,
    normalizer: RecordNormalizer,
    writer: QuoteWriter,
    schedule: ScheduleConfig,
    stats: SymbolStats,
    status: StatusHandle,
}

impl SymbolPipeline {
    /// Pause before the next scheduled cycle. Degradation only ever slows
    /// a symbol down.
    fn interval(&self) -> Duration {
        if self.stats.is_degraded() {
            self.schedule
                .degraded_interval
                .max(self.schedule.fetch_interval)
        } else {
            self.schedule.fetch_interval
        }
    }

    /// Fills `report` as stages complete, so a failed persist still carries
    /// what was fetched and dropped.
    async fn execute(
        &mut self,
        observed_at: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        // bounded by the retry policy and the per-request timeout
        self.status.set_stage(CycleStage::Fetching);
        let payload = self.fetcher.fetch(&self.symbol).await?;

        self.status.set_stage(CycleStage::Normalizing);
        let batch = self.normalizer.normalize(&self.symbol, &payload, observed_at)?;
        report.fetched = batch.records.len();
        report.dropped_rows = batch.dropped_rows;
        report.unkeyed_dropped = batch.unkeyed_dropped;

        self.status.set_stage(CycleStage::Persisting);
        let limit = self.schedule.cycle_timeout;
        // an expired write is abandoned, not rolled back; the store may still commit it
        report.outcome = timeout(limit, self.writer.persist(&batch.records))
            .await
            .map_err(|_| CycleError::TimedOut(limit))??;
        Ok(())
    }

    /// Runs one fetch → normalize → persist pass. Never fails: errors are
    /// classified into the returned report and the stats.
    async fn run_cycle(&mut self) -> CycleReport {
        let cycle = self.stats.next_cycle();
        let was_degraded = self.stats.is_degraded();
        let started_at = Utc::now();

        let mut report = CycleReport {
            symbol: self.symbol.clone(),
            cycle,
            started_at,
            finished_at: started_at,
            fetched: 0,
            dropped_rows: 0,
            unkeyed_dropped: 0,
            outcome: PersistOutcome::default(),
            error: None,
        };
        let result = self.execute(started_at, &mut report).await;
        report.finished_at = Utc::now();

        match result {
            Ok(()) => {
                info!(
                    symbol = %self.symbol,
                    cycle,
                    fetched = report.fetched,
                    accepted = report.accepted(),
                    rejected = report.rejected(),
                    elapsed_ms = (report.finished_at - started_at).num_milliseconds(),
                    "cycle complete"
                );
            }
            Err(err) => {
                self.status.set_stage(CycleStage::CycleFailed);
                let failure = CycleFailure::from(&err);
                warn!(
                    symbol = %self.symbol,
                    cycle,
                    kind = %failure.kind,
                    fetched = report.fetched,
                    consecutive_failures = self.stats.consecutive_failures() + 1,
                    "cycle failed: {}",
                    err
                );
                report.error = Some(failure);
            }
        }

        self.stats.record(report.clone());
        self.status.publish(self.stats.snapshot(CycleStage::Idle));

        match (was_degraded, self.stats.is_degraded()) {
            (false, true) => warn!(
                symbol = %self.symbol,
                consecutive_failures = self.stats.consecutive_failures(),
                interval_secs = self.interval().as_secs(),
                "symbol degraded, slowing down"
            ),
            (true, false) => info!(symbol = %self.symbol, "symbol recovered"),
            _ => {}
        }

        let every = self.schedule.summary_every;
        if every > 0 && self.stats.total_cycles() % every == 0 {
            self.log_summary().await;
        }

        report
    }

    async fn log_summary(&self) {
        let snap = self.stats.snapshot(CycleStage::Idle);
        info!(
            symbol = %self.symbol,
            cycles = snap.total_cycles,
            success_rate = %format!("{:.1}%", snap.success_rate * 100.0),
            accepted = snap.totals_accepted,
            rejected = snap.totals_rejected,
            dropped_rows = snap.dropped_rows,
            consecutive_failures = snap.consecutive_failures,
            "pipeline summary"
        );

        match timeout(self.schedule.cycle_timeout, self.writer.symbol_stats(&self.symbol)).await {
            Ok(Ok(legs)) => {
                let now = Utc::now();
                for (leg, stats) in legs {
                    let freshness_secs = stats.latest_observed_at.map(|at| (now - at).num_seconds());
                    info!(
                        symbol = %self.symbol,
                        leg = %leg,
                        documents = stats.documents,
                        latest_snapshot = stats.latest_snapshot_documents,
                        freshness_secs = ?freshness_secs,
                        "store summary"
                    );
                }
            }
            Ok(Err(err)) => warn!(symbol = %self.symbol, "store summary unavailable: {}", err),
            Err(_) => warn!(symbol = %self.symbol, "store summary timed out"),
        }
    }

    async fn run(mut self, cancel: CancellationToken, mut triggers: mpsc::Receiver<CycleRequest>) {
        info!(
            symbol = %self.symbol,
            interval_secs = self.schedule.fetch_interval.as_secs(),
            "symbol pipeline starting"
        );
        let mut next_run = Instant::now();
        let mut triggers_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = triggers.recv(), if triggers_open => match request {
                    Some(reply) => {
                        debug!(symbol = %self.symbol, "on-demand cycle");
                        let report = self.run_cycle().await;
                        // requester may have given up
                        let _ = reply.send(report);
                    }
                    None => triggers_open = false,
                },
                _ = sleep_until(next_run) => {
                    let started = Instant::now();
                    self.run_cycle().await;
                    let elapsed = started.elapsed();
                    let interval = self.interval();
                    if elapsed >= interval {
                        warn!(
                            symbol = %self.symbol,
                            elapsed_ms = elapsed.as_millis() as u64,
                            interval_ms = interval.as_millis() as u64,
                            "cycle overran its interval"
                        );
                        next_run = Instant::now();
                    } else {
                        next_run = started + interval;
                    }
                }
            }
        }

        self.status.set_stage(CycleStage::Idle);
        info!(
            symbol = %self.symbol,
            cycles = self.stats.total_cycles(),
            "symbol pipeline stopped"
        );
    }
}

/// Starts and owns the per-symbol pipelines.
pub struct Orchestrator {
    schedule: ScheduleConfig,
    retry: RetryPolicy,
    reject_unkeyed: bool,
    writer: QuoteWriter,
}

impl Orchestrator {
    pub fn new(config: &PipelineConfig, writer: QuoteWriter) -> Self {
        Self {
            schedule: config.schedule.clone(),
            retry: config.retry.clone(),
            reject_unkeyed: config.reject_unkeyed,
            writer,
        }
    }

    /// Spawns one task per `(symbol, source)`. Each symbol gets its own
    /// source so no session is ever used by two fetches at once.
    pub fn spawn(&self, sources: Vec<(String, Arc<dyn QuoteSource>)>) -> OrchestratorHandle {
        let cancel = CancellationToken::new();
        let mut symbols = Vec::with_capacity(sources.len());
        let mut tasks = Vec::with_capacity(sources.len());

        for (symbol, source) in sources {
            let stats = SymbolStats::new(
                &symbol,
                self.schedule.recent_cycles,
                self.schedule.failure_threshold,
            );
            let status = StatusHandle::new(stats.snapshot(CycleStage::Idle));
            let (trigger, triggers) = mpsc::channel(TRIGGER_QUEUE);

            let pipeline = SymbolPipeline {
                symbol: symbol.clone(),
                fetcher: FetchClient::new(source, self.retry.clone()),
                normalizer: RecordNormalizer::new(self.reject_unkeyed),
                writer: self.writer.clone(),
                schedule: self.schedule.clone(),
                stats,
                status: status.clone(),
            };
            tasks.push((symbol.clone(), tokio::spawn(pipeline.run(cancel.clone(), triggers))));
            symbols.push(SymbolHandle {
                symbol,
                status,
                trigger,
            });
        }

        OrchestratorHandle {
            cancel,
            symbols,
            tasks,
        }
    }
}

struct SymbolHandle {
    symbol: String,
    status: StatusHandle,
    trigger: mpsc::Sender<CycleRequest>,
}

/// Read surface and control over running pipelines.
pub struct OrchestratorHandle {
    cancel: CancellationToken,
    symbols: Vec<SymbolHandle>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl OrchestratorHandle {
    fn find(&self, symbol: &str) -> Option<&SymbolHandle> {
        self.symbols
            .iter()
            .find(|h| h.symbol.eq_ignore_ascii_case(symbol.trim()))
    }

    pub fn status(&self, symbol: &str) -> Option<StatusSnapshot> {
        self.find(symbol).map(|h| h.status.snapshot())
    }

    /// Snapshots of every symbol, in configuration order.
    pub fn statuses(&self) -> Vec<StatusSnapshot> {
        self.symbols.iter().map(|h| h.status.snapshot()).collect()
    }

    /// Runs one cycle for `symbol` as soon as its current cycle (if any)
    /// has finished, and waits for the report.
    pub async fn run_cycle_now(&self, symbol: &str) -> Result<CycleReport, TriggerError> {
        let handle = self
            .find(symbol)
            .ok_or_else(|| TriggerError::UnknownSymbol(symbol.to_string()))?;
        let stopped = || TriggerError::Stopped(handle.symbol.clone());

        let (reply, report) = oneshot::channel();
        handle.trigger.send(reply).await.map_err(|_| stopped())?;
        report.await.map_err(|_| stopped())
    }

    /// Signals every pipeline to stop at its next cycle boundary, waits for
    /// them, and returns the final snapshots.
    pub async fn stop(self) -> Vec<StatusSnapshot> {
        info!(symbols = self.symbols.len(), "stopping pipelines");
        self.cancel.cancel();
        for (symbol, task) in self.tasks {
            if let Err(err) = task.await {
                error!(symbol = %symbol, "pipeline task ended abnormally: {}", err);
            }
        }
        self.symbols.iter().map(|h| h.status.snapshot()).collect()
    }
}
