//! podmeter public API façade (in-process).
//!
//! The single entry point used by both the heartbeat pipeline and the poller
//! (`record_observation`) plus the live per-user query (`user_stats`).

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use podmeter_core::{merge, Clock, MergeResult, MeterError, MeterResult, UsageObservation, UserId, UserStats};
use podmeter_store::UsageCache;
use tracing::{debug, error, info};

/// Metering API surface.
#[async_trait::async_trait]
pub trait MeterApi: Send + Sync {
    /// Merge one observation into the cache. Fails only with
    /// `MalformedObservation` or `CacheUnavailable`.
    async fn record_observation(&self, obs: UsageObservation) -> MeterResult<MergeResult>;

    /// Seconds accrued since the last flush and the number of workloads
    /// updated within the active window.
    async fn user_stats(&self, user: UserId) -> MeterResult<UserStats>;
}

// ----------------- In-process implementation -----------------

/// Implementation over a `UsageCache`.
pub struct InProcMeter {
    cache: Arc<dyn UsageCache>,
    clock: Arc<dyn Clock>,
    active_window: Duration,
}

impl InProcMeter {
    pub fn new(cache: Arc<dyn UsageCache>, clock: Arc<dyn Clock>, active_window: Duration) -> Self {
        Self { cache, clock, active_window }
    }

    pub fn cache(&self) -> Arc<dyn UsageCache> { Arc::clone(&self.cache) }

    pub fn clock(&self) -> Arc<dyn Clock> { Arc::clone(&self.clock) }
}

#[async_trait::async_trait]
impl MeterApi for InProcMeter {
    async fn record_observation(&self, obs: UsageObservation) -> MeterResult<MergeResult> {
        let t0 = Instant::now();
        obs.validate()?;
        let key = obs.key();
        let mut result = MergeResult::Created;
        let merged = self.cache.update_workload_and_credit(&key, &mut |current| {
            let (next, res) = merge(current, &obs);
            result = res;
            (next, res.delta())
        });
        let stored = match merged {
            Ok(r) => r,
            Err(e) => {
                error!(key = %key, user = obs.user_id, error = %e, "usage merge failed; nothing applied");
                counter!("meter_merge_failed_total", 1u64);
                return Err(e.into());
            }
        };
        counter!("meter_merge_total", 1u64, "result" => result.label());
        match result {
            MergeResult::Created => info!(key = %key, user = obs.user_id, start = %obs.start_time, "usage record created"),
            MergeResult::Restarted => info!(key = %key, user = obs.user_id, start = %obs.start_time, "workload restarted; usage reset"),
            MergeResult::Accrued(delta) => debug!(key = %key, delta, total = stored.total_seconds, "usage accrued"),
        }
        if result.delta() > 0 {
            counter!("meter_accrued_seconds_total", result.delta());
        }
        histogram!("meter_record_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(result)
    }

    async fn user_stats(&self, user: UserId) -> MeterResult<UserStats> {
        let now = self.clock.now();
        let window = self.active_window.as_secs();
        let accrued = self.cache.user_seconds(user)?;
        let mut active = 0usize;
        for key in self.cache.workload_keys()? {
            match self.cache.get_workload(&key)? {
                Some(r) if r.user_id == user && r.idle_secs(now) < window => active += 1,
                _ => {}
            }
        }
        Ok(UserStats { accrued_seconds_since_last_flush: accrued, active_workload_count: active })
    }
}

// ----------------- Mock implementation -----------------

/// Scripted implementation for tests: pops queued results in order and falls
/// back to `Accrued(0)` when the script is exhausted. Every observation it
/// receives is recorded.
#[derive(Default)]
pub struct MockMeter {
    script: Mutex<VecDeque<MeterResult<MergeResult>>>,
    seen: Mutex<Vec<UsageObservation>>,
    pub stats: UserStats,
}

impl MockMeter {
    pub fn new() -> Self { Self::default() }

    pub fn push_result(&self, r: MeterResult<MergeResult>) {
        self.script.lock().unwrap_or_else(|p| p.into_inner()).push_back(r);
    }

    pub fn push_unavailable(&self, times: usize) {
        for _ in 0..times {
            self.push_result(Err(MeterError::CacheUnavailable("scripted outage".into())));
        }
    }

    pub fn seen(&self) -> Vec<UsageObservation> { self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone() }
}

#[async_trait::async_trait]
impl MeterApi for MockMeter {
    async fn record_observation(&self, obs: UsageObservation) -> MeterResult<MergeResult> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).push(obs);
        self.script.lock().unwrap_or_else(|p| p.into_inner()).pop_front().unwrap_or(Ok(MergeResult::Accrued(0)))
    }

    async fn user_stats(&self, _user: UserId) -> MeterResult<UserStats> { Ok(self.stats) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use podmeter_core::ManualClock;
    use podmeter_store::ShardedCache;

    fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap() }

    fn obs(id: &str, user: UserId, start: DateTime<Utc>, at: i64) -> UsageObservation {
        UsageObservation {
            workload_id: id.into(),
            namespace: format!("ns-{}", user),
            user_id: user,
            start_time: start,
            observed_at: t0() + chrono::Duration::seconds(at),
        }
    }

    fn meter() -> (InProcMeter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = Arc::new(ShardedCache::new(4, Duration::from_secs(86_400 * 8), Duration::from_secs(86_400), clock.clone()));
        (InProcMeter::new(cache, clock.clone(), Duration::from_secs(300)), clock)
    }

    #[tokio::test]
    async fn scenario_heartbeats_then_restart() {
        let (m, _clock) = meter();
        assert_eq!(m.record_observation(obs("w1", 1, t0(), 0)).await.unwrap(), MergeResult::Created);
        assert_eq!(m.record_observation(obs("w1", 1, t0(), 30)).await.unwrap(), MergeResult::Accrued(30));
        assert_eq!(m.record_observation(obs("w1", 1, t0(), 60)).await.unwrap(), MergeResult::Accrued(30));
        assert_eq!(m.record_observation(obs("w1", 1, t0(), 30)).await.unwrap(), MergeResult::Accrued(0));
        let rec = m.cache().get_workload(&obs("w1", 1, t0(), 0).key()).unwrap().unwrap();
        assert_eq!(rec.total_seconds, 60);
        assert_eq!(m.cache().user_seconds(1).unwrap(), 60);

        let t100 = t0() + chrono::Duration::seconds(100);
        assert_eq!(m.record_observation(obs("w1", 1, t100, 100)).await.unwrap(), MergeResult::Restarted);
        assert_eq!(m.record_observation(obs("w1", 1, t100, 110)).await.unwrap(), MergeResult::Accrued(10));
        let rec = m.cache().get_workload(&obs("w1", 1, t100, 0).key()).unwrap().unwrap();
        assert_eq!(rec.total_seconds, 10);
        // the user's running total keeps both instances' time
        assert_eq!(m.cache().user_seconds(1).unwrap(), 70);
    }

    #[tokio::test]
    async fn malformed_observation_is_rejected_before_cache() {
        let (m, _clock) = meter();
        let mut o = obs("w1", 1, t0(), 0);
        o.workload_id = String::new();
        assert!(matches!(m.record_observation(o).await, Err(MeterError::MalformedObservation(_))));
        assert!(m.cache().workload_keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_count_recent_workloads_for_user() {
        let (m, clock) = meter();
        m.record_observation(obs("a", 1, t0(), 0)).await.unwrap();
        m.record_observation(obs("b", 1, t0(), 0)).await.unwrap();
        m.record_observation(obs("c", 2, t0(), 0)).await.unwrap();
        clock.advance(chrono::Duration::seconds(240));
        m.record_observation(obs("a", 1, t0(), 240)).await.unwrap();
        clock.advance(chrono::Duration::seconds(120));
        // b was last seen 360s ago, a 120s ago
        let s = m.user_stats(1).await.unwrap();
        assert_eq!(s.active_workload_count, 1);
        assert_eq!(s.accrued_seconds_since_last_flush, 240);
        assert_eq!(m.user_stats(3).await.unwrap(), UserStats::default());
    }

    #[tokio::test]
    async fn mock_replays_script() {
        let m = MockMeter::new();
        m.push_unavailable(1);
        assert!(matches!(m.record_observation(obs("w", 1, t0(), 0)).await, Err(MeterError::CacheUnavailable(_))));
        assert_eq!(m.record_observation(obs("w", 1, t0(), 1)).await.unwrap(), MergeResult::Accrued(0));
        assert_eq!(m.seen().len(), 2);
    }
}
