//! Periodic job dispatch on tokio tasks with cooperative cancellation and a
//! bounded join.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::Job;

pub struct Scheduler {
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self { Self { tasks: JoinSet::new(), cancel } }

    pub fn token(&self) -> CancellationToken { self.cancel.clone() }

    /// Number of tasks not yet joined.
    pub fn len(&self) -> usize { self.tasks.len() }

    pub fn is_empty(&self) -> bool { self.tasks.is_empty() }

    /// Run `job` now and then every `period` until cancelled. Invocations of
    /// one job never overlap; a late tick is delayed rather than bunched.
    pub fn every(&mut self, period: Duration, job: Arc<dyn Job>) {
        let cancel = self.cancel.clone();
        let name = job.name();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let span = info_span!("job", job = name, run = %Uuid::new_v4());
                let started = Instant::now();
                let report = job.run(&cancel).instrument(span.clone()).await;
                let ms = started.elapsed().as_secs_f64() * 1000.0;
                histogram!("job_duration_ms", ms, "job" => name);
                span.in_scope(|| {
                    debug!(processed = report.processed, failed = report.failed, skipped = report.skipped, interrupted = report.interrupted, ms, "job finished")
                });
            }
            debug!(job = name, "job loop stopped");
        });
        info!(job = name, period_ms = period.as_millis() as u64, "job scheduled");
    }

    /// Spawn a long-running task that is expected to watch the shared token.
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(fut.instrument(info_span!("task", task = name)));
    }

    /// Wait for every task to finish, at most `timeout`. Stragglers are
    /// aborted. Returns `true` when everything finished in time.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!(error = %e, "scheduled task panicked");
                    }
                }
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(remaining = self.tasks.len(), timeout_ms = timeout.as_millis() as u64, "drain timed out; aborting remaining tasks");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
        drained
    }
}
