//! podmeter core: observations, cached usage records, the merge engine and
//! the error taxonomy shared by every other crate.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod codec;
pub mod config;
pub mod merge;

pub use config::MeterConfig;
pub use merge::{merge, MergeResult};

pub type UserId = u64;

/// Cache key of a workload: `(namespace, workload_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub workload_id: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, workload_id: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), workload_id: workload_id.into() }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pod_usage:{}:{}", self.namespace, self.workload_id)
    }
}

/// "As of `observed_at`, workload `workload_id` (owned by `user_id`, started at
/// `start_time`) is alive." Produced by heartbeats and by the poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageObservation {
    pub workload_id: String,
    pub namespace: String,
    pub user_id: UserId,
    pub start_time: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl UsageObservation {
    pub fn key(&self) -> WorkloadKey { WorkloadKey::new(self.namespace.clone(), self.workload_id.clone()) }

    /// Reject observations that cannot be keyed.
    pub fn validate(&self) -> MeterResult<()> {
        if self.workload_id.trim().is_empty() {
            return Err(MeterError::MalformedObservation("empty workload id".into()));
        }
        if self.namespace.trim().is_empty() {
            return Err(MeterError::MalformedObservation(format!("workload {} has empty namespace", self.workload_id)));
        }
        Ok(())
    }
}

/// Per-workload usage as held by the cache.
///
/// `total_seconds` never decreases while `start_time` stays the same.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedUsageRecord {
    pub workload_id: String,
    pub namespace: String,
    pub user_id: UserId,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub total_seconds: u64,
}

impl CachedUsageRecord {
    /// Zeroed record for the instance described by `obs`.
    pub fn fresh(obs: &UsageObservation) -> Self {
        Self {
            workload_id: obs.workload_id.clone(),
            namespace: obs.namespace.clone(),
            user_id: obs.user_id,
            start_time: obs.start_time,
            last_update: obs.observed_at,
            total_seconds: 0,
        }
    }

    pub fn key(&self) -> WorkloadKey { WorkloadKey::new(self.namespace.clone(), self.workload_id.clone()) }

    /// Whole seconds since the last update (zero if `now` is behind it).
    pub fn idle_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.last_update).num_seconds().max(0) as u64
    }
}

/// Live view of one user's metering state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserStats {
    pub accrued_seconds_since_last_flush: u64,
    pub active_workload_count: usize,
}

/// Failure classes of the metering engine. None of them is process-fatal.
#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    #[error("malformed observation: {0}")]
    MalformedObservation(String),
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("durable write failed: {0}")]
    DurableWriteFailed(String),
    #[error("orchestrator query failed: {0}")]
    OrchestratorQueryFailed(String),
}

pub type MeterResult<T> = Result<T, MeterError>;

/// Source of wall-clock time for every time-dependent rule.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self { Self { now: Mutex::new(start) } }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut g = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *g += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> { *self.now.lock().unwrap_or_else(|p| p.into_inner()) }
}

/// Map a key onto one of `buckets` stripes using 64-bit FNV-1a over
/// `namespace/workload_id`.
pub fn shard_of(key: &WorkloadKey, buckets: usize) -> usize {
    if buckets <= 1 { return 0; }
    let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
    for b in key.namespace.as_bytes().iter().chain(b"/").chain(key.workload_id.as_bytes()) {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h % buckets as u64) as usize
}

pub mod prelude {
    pub use super::{
        CachedUsageRecord, Clock, ManualClock, MergeResult, MeterError, MeterResult, SystemClock, UsageObservation,
        UserId, UserStats, WorkloadKey,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obs(ns: &str, id: &str) -> UsageObservation {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        UsageObservation { workload_id: id.into(), namespace: ns.into(), user_id: 1, start_time: t, observed_at: t }
    }

    #[test]
    fn validate_rejects_blank_identity() {
        assert!(obs("ns-1", "w1").validate().is_ok());
        assert!(matches!(obs("ns-1", "  ").validate(), Err(MeterError::MalformedObservation(_))));
        assert!(matches!(obs("", "w1").validate(), Err(MeterError::MalformedObservation(_))));
    }

    #[test]
    fn shard_is_stable_and_in_range() {
        let k = WorkloadKey::new("ns-7", "dev-abc");
        let a = shard_of(&k, 16);
        assert_eq!(a, shard_of(&k, 16));
        assert!(a < 16);
        assert_eq!(shard_of(&k, 1), 0);
        assert_eq!(shard_of(&k, 0), 0);
    }

    #[test]
    fn key_display_matches_cache_namespace() {
        assert_eq!(WorkloadKey::new("ns-3", "w").to_string(), "pod_usage:ns-3:w");
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let c = ManualClock::new(start);
        c.advance(chrono::Duration::seconds(90));
        assert_eq!(c.now(), start + chrono::Duration::seconds(90));
    }
}
