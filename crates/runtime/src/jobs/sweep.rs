//! Retention sweep: evict workload records idle beyond the retention window.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use podmeter_core::Clock;
use podmeter_store::UsageCache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Job, JobReport};

pub struct SweepJob {
    cache: Arc<dyn UsageCache>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl SweepJob {
    pub fn new(cache: Arc<dyn UsageCache>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self { cache, clock, retention }
    }
}

#[async_trait::async_trait]
impl Job for SweepJob {
    fn name(&self) -> &'static str { "sweep" }

    async fn run(&self, cancel: &CancellationToken) -> JobReport {
        let mut report = JobReport::default();
        match self.cache.purge_expired() {
            Ok(n) if n > 0 => info!(purged = n, "expired cache entries purged"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "ttl purge failed"),
        }

        let keys = match self.cache.workload_keys() {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "cannot enumerate cached workloads; sweep skipped");
                report.failed += 1;
                return report;
            }
        };
        let retention = chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let now = self.clock.now();
        for key in keys {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            match self.cache.remove_workload_if(&key, &|r| now - r.last_update > retention) {
                Ok(true) => {
                    debug!(key = %key, "stale usage record evicted");
                    report.processed += 1;
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "eviction failed");
                    report.failed += 1;
                }
            }
        }
        counter!("sweep_evicted_total", report.processed as u64);
        report
    }
}
