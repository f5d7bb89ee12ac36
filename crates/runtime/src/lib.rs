//! podmeter runtime: heartbeat ingestion, the periodic jobs (poll, sync,
//! sweep), the scheduler that drives them and the lifecycle coordinator.

#![forbid(unsafe_code)]

pub mod ingest;
pub mod jobs;
pub mod lifecycle;
pub mod scheduler;
pub mod source;

use tokio_util::sync::CancellationToken;

pub use ingest::{run_ingest, Backoff, IngestReport};
pub use jobs::{PollJob, SweepJob, SyncJob};
pub use lifecycle::{Collaborators, Coordinator, LifecycleState, ShutdownReport};
pub use scheduler::Scheduler;
pub use source::{decode_heartbeat, pump_lines, Delivery, HeartbeatPayload, HeartbeatSource, LineSource, MemoryQueue, QueueProducer};

/// Outcome of one job invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    /// Keys (or namespaces) handled successfully.
    pub processed: usize,
    /// Keys whose handling failed and were skipped.
    pub failed: usize,
    /// Keys visited that needed no work.
    pub skipped: usize,
    /// The pass stopped early on cancellation.
    pub interrupted: bool,
}

/// A periodic unit of work. Errors are handled inside the job; the report is
/// for logging and tests.
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    /// One invocation. Implementations check `cancel` between keys.
    async fn run(&self, cancel: &CancellationToken) -> JobReport;
}
