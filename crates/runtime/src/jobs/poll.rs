//! Active-workload poller: samples running workloads and feeds synthetic
//! observations through the engine.

use std::sync::Arc;

use metrics::counter;
use podmeter_api::MeterApi;
use podmeter_core::{Clock, MeterError, UsageObservation};
use podmeter_kubehub::{UserDirectory, WorkloadLister};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Job, JobReport};

pub struct PollJob {
    meter: Arc<dyn MeterApi>,
    lister: Arc<dyn WorkloadLister>,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
}

impl PollJob {
    pub fn new(
        meter: Arc<dyn MeterApi>,
        lister: Arc<dyn WorkloadLister>,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { meter, lister, directory, clock }
    }
}

#[async_trait::async_trait]
impl Job for PollJob {
    fn name(&self) -> &'static str { "poll" }

    async fn run(&self, cancel: &CancellationToken) -> JobReport {
        let mut report = JobReport::default();
        let targets = match self.directory.user_namespaces().await {
            Ok(t) => t,
            Err(e) => {
                let e = MeterError::OrchestratorQueryFailed(format!("{:#}", e));
                warn!(error = %e, "user directory unavailable; skipping poll");
                report.failed += 1;
                return report;
            }
        };

        for (user, namespace) in targets {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let running = match self.lister.list_running_workloads(&namespace).await {
                Ok(w) => w,
                Err(e) => {
                    let e = MeterError::OrchestratorQueryFailed(format!("{:#}", e));
                    warn!(namespace = %namespace, user, error = %e, "listing workloads failed");
                    counter!("poll_namespace_failed_total", 1u64);
                    report.failed += 1;
                    continue;
                }
            };
            if running.is_empty() {
                report.skipped += 1;
                continue;
            }
            let now = self.clock.now();
            for w in running {
                let obs = UsageObservation {
                    workload_id: w.id,
                    namespace: namespace.clone(),
                    user_id: user,
                    start_time: w.creation_time,
                    observed_at: now,
                };
                let workload = obs.workload_id.clone();
                match self.meter.record_observation(obs).await {
                    Ok(r) => {
                        debug!(namespace = %namespace, workload = %workload, result = r.label(), "polled");
                        report.processed += 1;
                    }
                    Err(e) => {
                        warn!(namespace = %namespace, workload = %workload, error = %e, "polled observation not merged");
                        report.failed += 1;
                    }
                }
            }
        }
        counter!("poll_observations_total", report.processed as u64);
        report
    }
}
