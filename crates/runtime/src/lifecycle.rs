//! Lifecycle coordinator: `Stopped -> Running -> Draining -> Stopped`.
//!
//! Owns the scheduler and the shutdown token. Stopping cancels the token,
//! waits (bounded) for in-flight work and then runs one final sync pass.

use std::sync::Arc;
use std::time::Instant;

use podmeter_api::{InProcMeter, MeterApi};
use podmeter_core::{Clock, MeterConfig};
use podmeter_kubehub::{UserDirectory, WorkloadLister};
use podmeter_persist::UsageSink;
use podmeter_store::UsageCache;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ingest::{run_ingest, Backoff};
use crate::jobs::{PollJob, SweepJob, SyncJob};
use crate::scheduler::Scheduler;
use crate::source::HeartbeatSource;
use crate::JobReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Stopped,
    Running,
    Draining,
}

/// External dependencies of a running engine.
#[derive(Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn UsageCache>,
    pub sink: Arc<dyn UsageSink>,
    pub lister: Arc<dyn WorkloadLister>,
    pub directory: Arc<dyn UserDirectory>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// All jobs and the ingestion loop finished within the drain timeout.
    pub drained_in_time: bool,
    pub final_flush: JobReport,
}

pub struct Coordinator {
    cfg: MeterConfig,
    meter: Arc<InProcMeter>,
    poll: Arc<PollJob>,
    sync: Arc<SyncJob>,
    sweep: Arc<SweepJob>,
    heartbeats: Option<Box<dyn HeartbeatSource>>,
    scheduler: Option<Scheduler>,
    state: watch::Sender<LifecycleState>,
}

impl Coordinator {
    pub fn new(cfg: MeterConfig, collab: Collaborators) -> Self {
        let cfg = cfg.normalized();
        let meter = Arc::new(InProcMeter::new(collab.cache.clone(), collab.clock.clone(), cfg.active_window));
        let poll = Arc::new(PollJob::new(meter.clone(), collab.lister, collab.directory, collab.clock.clone()));
        let sync = Arc::new(SyncJob::new(collab.cache.clone(), collab.sink, collab.clock.clone()));
        let sweep = Arc::new(SweepJob::new(collab.cache, collab.clock, cfg.retention));
        let (state, _) = watch::channel(LifecycleState::Stopped);
        Self { cfg, meter, poll, sync, sweep, heartbeats: None, scheduler: None, state }
    }

    /// Consume heartbeats from `source` while running. The source is used by
    /// the next `start` only.
    pub fn with_heartbeats(mut self, source: Box<dyn HeartbeatSource>) -> Self {
        self.heartbeats = Some(source);
        self
    }

    /// Engine facade shared with ingestion and the poller.
    pub fn meter(&self) -> Arc<dyn MeterApi> { self.meter.clone() }

    pub fn config(&self) -> &MeterConfig { &self.cfg }

    pub fn state(&self) -> LifecycleState { *self.state.borrow() }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> { self.state.subscribe() }

    /// Dispatch the periodic jobs and the ingestion loop. No-op unless stopped.
    pub fn start(&mut self) {
        if self.state() != LifecycleState::Stopped {
            warn!(state = ?self.state(), "start ignored");
            return;
        }
        let mut scheduler = Scheduler::new(CancellationToken::new());
        scheduler.every(self.cfg.poll_interval, self.poll.clone());
        scheduler.every(self.cfg.sync_interval, self.sync.clone());
        scheduler.every(self.cfg.sweep_interval, self.sweep.clone());
        if let Some(mut source) = self.heartbeats.take() {
            let meter = self.meter.clone();
            let backoff = Backoff::new(self.cfg.ingest_backoff_initial, self.cfg.ingest_backoff_max);
            let cancel = scheduler.token();
            scheduler.spawn("ingest", async move {
                run_ingest(source.as_mut(), meter.as_ref(), backoff, cancel).await;
            });
        }
        self.scheduler = Some(scheduler);
        self.state.send_replace(LifecycleState::Running);
        info!(
            poll_s = self.cfg.poll_interval.as_secs(),
            sync_s = self.cfg.sync_interval.as_secs(),
            sweep_s = self.cfg.sweep_interval.as_secs(),
            "metering started"
        );
    }

    /// Drain and flush. Never fails; a timed-out drain is reported and the
    /// final flush still runs.
    pub async fn stop(&mut self) -> ShutdownReport {
        let Some(mut scheduler) = self.scheduler.take() else {
            return ShutdownReport { drained_in_time: true, final_flush: JobReport::default() };
        };
        self.state.send_replace(LifecycleState::Draining);
        let started = Instant::now();
        scheduler.token().cancel();
        let drained_in_time = scheduler.join(self.cfg.drain_timeout).await;
        if !drained_in_time {
            warn!(timeout_ms = self.cfg.drain_timeout.as_millis() as u64, "in-flight work did not finish before the drain timeout");
        }
        let final_flush = self.sync.flush_all().await;
        self.state.send_replace(LifecycleState::Stopped);
        info!(
            drained_in_time,
            flushed = final_flush.processed,
            failed = final_flush.failed,
            ms = started.elapsed().as_millis() as u64,
            "metering stopped"
        );
        ShutdownReport { drained_in_time, final_flush }
    }
}
