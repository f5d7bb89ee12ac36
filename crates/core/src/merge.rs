//! Merge engine: reconcile one observation with the cached record for its key.
//!
//! Pure functions only; the caller provides per-key atomicity.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{CachedUsageRecord, UsageObservation};

/// Outcome of merging an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeResult {
    /// First observation for the key.
    Created,
    /// Same instance; this many whole seconds were added.
    Accrued(u64),
    /// `start_time` changed: the key now belongs to a new instance.
    Restarted,
}

impl MergeResult {
    /// Seconds to add to the owning user's aggregate.
    pub fn delta(&self) -> u64 {
        match self {
            MergeResult::Accrued(d) => *d,
            MergeResult::Created | MergeResult::Restarted => 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MergeResult::Created => "created",
            MergeResult::Accrued(_) => "accrued",
            MergeResult::Restarted => "restarted",
        }
    }
}

/// Compute the next record for `obs` given the currently cached one.
///
/// `last_update` only ever advances by the whole seconds that were accrued, so
/// fractional remainders carry into the next delta and a late or duplicated
/// observation (`observed_at <= last_update`) leaves the record untouched.
pub fn merge(existing: Option<&CachedUsageRecord>, obs: &UsageObservation) -> (CachedUsageRecord, MergeResult) {
    let Some(current) = existing else {
        return (CachedUsageRecord::fresh(obs), MergeResult::Created);
    };
    if current.start_time != obs.start_time {
        return (CachedUsageRecord::fresh(obs), MergeResult::Restarted);
    }
    let delta = (obs.observed_at - current.last_update).num_seconds().max(0);
    let mut next = current.clone();
    if delta > 0 {
        next.total_seconds = next.total_seconds.saturating_add(delta as u64);
        next.last_update = current.last_update + Duration::seconds(delta);
    }
    (next, MergeResult::Accrued(delta as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap() }

    fn at(start: DateTime<Utc>, secs: i64) -> UsageObservation {
        UsageObservation {
            workload_id: "w1".into(),
            namespace: "ns-1".into(),
            user_id: 1,
            start_time: start,
            observed_at: t0() + Duration::seconds(secs),
        }
    }

    fn apply(rec: &mut Option<CachedUsageRecord>, obs: &UsageObservation) -> MergeResult {
        let (next, res) = merge(rec.as_ref(), obs);
        *rec = Some(next);
        res
    }

    #[test]
    fn heartbeats_accrue_and_duplicate_is_noop() {
        let mut rec = None;
        assert_eq!(apply(&mut rec, &at(t0(), 0)), MergeResult::Created);
        assert_eq!(apply(&mut rec, &at(t0(), 30)), MergeResult::Accrued(30));
        assert_eq!(apply(&mut rec, &at(t0(), 60)), MergeResult::Accrued(30));
        assert_eq!(rec.as_ref().unwrap().total_seconds, 60);

        // late duplicate of the T0+30 heartbeat
        assert_eq!(apply(&mut rec, &at(t0(), 30)), MergeResult::Accrued(0));
        let r = rec.as_ref().unwrap();
        assert_eq!(r.total_seconds, 60);
        assert_eq!(r.last_update, t0() + Duration::seconds(60));

        // the stale duplicate must not have rewound the clock
        assert_eq!(apply(&mut rec, &at(t0(), 90)), MergeResult::Accrued(30));
        assert_eq!(rec.unwrap().total_seconds, 90);
    }

    #[test]
    fn replaying_same_observation_adds_nothing() {
        let mut rec = None;
        apply(&mut rec, &at(t0(), 0));
        let o = at(t0(), 45);
        assert_eq!(apply(&mut rec, &o), MergeResult::Accrued(45));
        let before = rec.clone();
        assert_eq!(apply(&mut rec, &o), MergeResult::Accrued(0));
        assert_eq!(rec, before);
    }

    #[test]
    fn total_equals_sum_of_gaps() {
        let gaps = [1i64, 7, 30, 30, 29, 600, 3, 86_400, 2];
        let mut rec = None;
        apply(&mut rec, &at(t0(), 0));
        let mut now = 0;
        for g in gaps {
            now += g;
            apply(&mut rec, &at(t0(), now));
        }
        assert_eq!(rec.unwrap().total_seconds, gaps.iter().sum::<i64>() as u64);
    }

    #[test]
    fn sub_second_spacing_does_not_drift() {
        let mut rec = None;
        let base = at(t0(), 0);
        apply(&mut rec, &base);
        for i in 1..=10 {
            let mut o = base.clone();
            o.observed_at = t0() + Duration::milliseconds(600 * i);
            apply(&mut rec, &o);
        }
        // 6.0s elapsed in total
        assert_eq!(rec.unwrap().total_seconds, 6);
    }

    #[test]
    fn new_start_time_resets_regardless_of_observed_at() {
        let mut rec = None;
        apply(&mut rec, &at(t0(), 0));
        apply(&mut rec, &at(t0(), 60));
        assert_eq!(rec.as_ref().unwrap().total_seconds, 60);

        let t100 = t0() + Duration::seconds(100);
        assert_eq!(apply(&mut rec, &at(t100, 100)), MergeResult::Restarted);
        assert_eq!(rec.as_ref().unwrap().total_seconds, 0);
        assert_eq!(apply(&mut rec, &at(t100, 110)), MergeResult::Accrued(10));
        assert_eq!(rec.as_ref().unwrap().total_seconds, 10);

        // an observation with an older observed_at but different start still resets
        let other = t0() + Duration::seconds(5);
        assert_eq!(apply(&mut rec, &at(other, 20)), MergeResult::Restarted);
        assert_eq!(rec.unwrap().total_seconds, 0);
    }

    #[test]
    fn delta_only_for_accrued() {
        assert_eq!(MergeResult::Created.delta(), 0);
        assert_eq!(MergeResult::Restarted.delta(), 0);
        assert_eq!(MergeResult::Accrued(12).delta(), 12);
    }
}
