//! Durability sync: copy cached usage into the durable store.

use std::sync::Arc;

use metrics::counter;
use podmeter_core::{Clock, MeterError};
use podmeter_persist::{UpsertOutcome, UsageSink};
use podmeter_store::UsageCache;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Job, JobReport};

pub struct SyncJob {
    cache: Arc<dyn UsageCache>,
    sink: Arc<dyn UsageSink>,
    clock: Arc<dyn Clock>,
    // passes never interleave
    flush_lock: Mutex<()>,
}

impl SyncJob {
    pub fn new(cache: Arc<dyn UsageCache>, sink: Arc<dyn UsageSink>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, sink, clock, flush_lock: Mutex::new(()) }
    }

    /// Unconditional pass that ignores cancellation; used for the shutdown flush.
    pub async fn flush_all(&self) -> JobReport { self.pass(None).await }

    async fn pass(&self, cancel: Option<&CancellationToken>) -> JobReport {
        let _guard = self.flush_lock.lock().await;
        let mut report = JobReport::default();
        let stop = |r: &mut JobReport| {
            let c = cancel.map(|c| c.is_cancelled()).unwrap_or(false);
            if c {
                r.interrupted = true;
            }
            c
        };

        let keys = match self.cache.workload_keys() {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "cannot enumerate cached workloads; skipping workload rows");
                report.failed += 1;
                Vec::new()
            }
        };
        for key in keys {
            if stop(&mut report) {
                return report;
            }
            let record = match self.cache.get_workload(&key) {
                Ok(Some(r)) => r,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "cache read failed; row skipped");
                    report.failed += 1;
                    continue;
                }
            };
            let day = self.clock.now().date_naive();
            match self.sink.upsert_daily_workload_usage(day, &record) {
                Ok(UpsertOutcome::Unchanged) => report.skipped += 1,
                Ok(outcome) => {
                    debug!(key = %key, day = %day, total = record.total_seconds, ?outcome, "usage row written");
                    counter!("sync_rows_written_total", 1u64);
                    report.processed += 1;
                }
                Err(e) => {
                    let e = MeterError::DurableWriteFailed(format!("{:#}", e));
                    warn!(key = %key, day = %day, error = %e, "usage row not written");
                    counter!("sync_write_failed_total", 1u64);
                    report.failed += 1;
                }
            }
        }

        let users = match self.cache.user_ids() {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "cannot enumerate user aggregates; skipping user events");
                report.failed += 1;
                Vec::new()
            }
        };
        for user in users {
            if stop(&mut report) {
                return report;
            }
            let total = match self.cache.user_seconds(user) {
                Ok(0) => {
                    report.skipped += 1;
                    continue;
                }
                Ok(t) => t,
                Err(e) => {
                    warn!(user, error = %e, "cache read failed; user event skipped");
                    report.failed += 1;
                    continue;
                }
            };
            if let Err(e) = self.sink.insert_user_usage_event(user, total, self.clock.now()) {
                let e = MeterError::DurableWriteFailed(format!("{:#}", e));
                warn!(user, total, error = %e, "user usage event not written");
                counter!("sync_write_failed_total", 1u64);
                report.failed += 1;
                continue;
            }
            match self.cache.deduct_user_seconds(user, total) {
                Ok(rest) => debug!(user, flushed = total, remaining = rest, "user aggregate flushed"),
                // the event is written; the next pass will flush this amount again
                Err(e) => warn!(user, flushed = total, error = %e, "user aggregate reset failed"),
            }
            counter!("sync_user_events_total", 1u64);
            report.processed += 1;
        }

        info!(written = report.processed, unchanged = report.skipped, failed = report.failed, "sync pass done");
        report
    }
}

#[async_trait::async_trait]
impl Job for SyncJob {
    fn name(&self) -> &'static str { "sync" }

    async fn run(&self, cancel: &CancellationToken) -> JobReport { self.pass(Some(cancel)).await }
}
