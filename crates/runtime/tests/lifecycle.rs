#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use podmeter_core::{ManualClock, MeterConfig};
use podmeter_kubehub::{StaticDirectory, WorkloadInfo, WorkloadLister, WorkloadPhase};
use podmeter_persist::SqliteStore;
use podmeter_runtime::{Collaborators, Coordinator, HeartbeatPayload, LifecycleState, MemoryQueue};
use podmeter_store::{ShardedCache, UsageCache};

fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap() }

fn quick_config(drain: Duration) -> MeterConfig {
    MeterConfig {
        poll_interval: Duration::from_millis(20),
        sync_interval: Duration::from_millis(50),
        sweep_interval: Duration::from_secs(3600),
        drain_timeout: drain,
        ingest_backoff_initial: Duration::from_millis(1),
        ingest_backoff_max: Duration::from_millis(5),
        ..MeterConfig::default()
    }
}

struct OnePod;

#[async_trait::async_trait]
impl WorkloadLister for OnePod {
    async fn list_workloads(&self, _namespace: &str) -> Result<Vec<WorkloadInfo>> {
        Ok(vec![WorkloadInfo { id: "dev-a".into(), creation_time: t0(), phase: WorkloadPhase::Running }])
    }
}

/// Never answers and ignores cancellation.
struct Hung;

#[async_trait::async_trait]
impl WorkloadLister for Hung {
    async fn list_workloads(&self, _namespace: &str) -> Result<Vec<WorkloadInfo>> {
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

fn collaborators(lister: Arc<dyn WorkloadLister>) -> (Collaborators, Arc<ShardedCache>, Arc<SqliteStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let cache = Arc::new(ShardedCache::new(4, Duration::from_secs(86_400 * 8), Duration::from_secs(86_400), clock.clone()));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let collab = Collaborators {
        cache: cache.clone(),
        sink: store.clone(),
        lister,
        directory: Arc::new(StaticDirectory::new(vec![(1, "ns-1".to_string())])),
        clock: clock.clone(),
    };
    (collab, cache, store, clock)
}

fn hb(id: &str, at: i64) -> HeartbeatPayload {
    HeartbeatPayload {
        workload_id: id.into(),
        namespace: "ns-1".into(),
        user_id: 1,
        start_time: t0(),
        observed_at: t0() + chrono::Duration::seconds(at),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runs_jobs_and_flushes_on_stop() {
    let (collab, cache, store, _clock) = collaborators(Arc::new(OnePod));
    let (tx, queue) = MemoryQueue::new(16);
    let mut coord = Coordinator::new(quick_config(Duration::from_secs(2)), collab).with_heartbeats(Box::new(queue));
    let mut states = coord.subscribe();
    assert_eq!(coord.state(), LifecycleState::Stopped);

    coord.start();
    assert_eq!(coord.state(), LifecycleState::Running);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), LifecycleState::Running);

    tx.send_heartbeat(&hb("sidecar", 0)).await.unwrap();
    tx.send_heartbeat(&hb("sidecar", 45)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let stats = coord.meter().user_stats(1).await.unwrap();
    assert_eq!(stats.active_workload_count, 2);

    let report = coord.stop().await;
    assert!(report.drained_in_time);
    assert_eq!(coord.state(), LifecycleState::Stopped);

    let rows = store.workload_rows(None, Some(1)).unwrap();
    let mut totals: Vec<(String, u64)> = rows.iter().map(|r| (r.workload_id.clone(), r.total_seconds)).collect();
    totals.sort();
    assert_eq!(totals, vec![("dev-a".to_string(), 0), ("sidecar".to_string(), 45)]);
    assert_eq!(store.user_total(1, None, None).unwrap(), 45);
    assert_eq!(cache.user_seconds(1).unwrap(), 0);

    // a second stop is a no-op
    let again = coord.stop().await;
    assert!(again.drained_in_time);
    assert_eq!(again.final_flush, Default::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_job_hits_drain_timeout_but_final_flush_runs() {
    let (collab, _cache, store, _clock) = collaborators(Arc::new(Hung));
    let (tx, queue) = MemoryQueue::new(16);
    let mut coord = Coordinator::new(quick_config(Duration::from_millis(100)), collab).with_heartbeats(Box::new(queue));
    coord.start();

    tx.send_heartbeat(&hb("sidecar", 0)).await.unwrap();
    tx.send_heartbeat(&hb("sidecar", 10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let report = tokio::time::timeout(Duration::from_secs(5), coord.stop()).await.expect("stop must be bounded");
    assert!(!report.drained_in_time);
    assert_eq!(coord.state(), LifecycleState::Stopped);
    let rows = store.workload_rows(None, Some(1)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].total_seconds, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_without_start_is_harmless() {
    let (collab, _cache, store, _clock) = collaborators(Arc::new(OnePod));
    let mut coord = Coordinator::new(quick_config(Duration::from_secs(1)), collab);
    let report = coord.stop().await;
    assert!(report.drained_in_time);
    assert_eq!(coord.state(), LifecycleState::Stopped);
    assert!(store.workload_rows(None, None).unwrap().is_empty());
}
