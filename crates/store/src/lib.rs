//! podmeter store: the usage cache.
//!
//! A keyed, mutable store of per-workload usage records and per-user running
//! totals, with per-key expiry. Every read-modify-write of a key happens under
//! that key's stripe lock; distinct stripes never contend.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use podmeter_core::codec::{decode_record, encode_record};
use podmeter_core::{shard_of, CachedUsageRecord, Clock, MeterConfig, MeterError, UserId, WorkloadKey};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl From<CacheError> for MeterError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Unavailable(m) => MeterError::CacheUnavailable(m),
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Keyed usage store with atomic per-key operations.
pub trait UsageCache: Send + Sync {
    /// Atomically replace the record for `key` with `f(current)`. `current` is
    /// `None` when the key is absent, expired or unreadable.
    fn update_workload(
        &self,
        key: &WorkloadKey,
        f: &mut dyn FnMut(Option<&CachedUsageRecord>) -> CachedUsageRecord,
    ) -> CacheResult<CachedUsageRecord>;

    /// Like `update_workload`, but `f` also returns seconds to credit to the
    /// record's owner. The record and the user total change together or not
    /// at all.
    fn update_workload_and_credit(
        &self,
        key: &WorkloadKey,
        f: &mut dyn FnMut(Option<&CachedUsageRecord>) -> (CachedUsageRecord, u64),
    ) -> CacheResult<CachedUsageRecord>;

    fn get_workload(&self, key: &WorkloadKey) -> CacheResult<Option<CachedUsageRecord>>;

    /// Keys of all live workload records.
    fn workload_keys(&self) -> CacheResult<Vec<WorkloadKey>>;

    /// Delete the record if `pred` holds for it, checked under the key lock.
    fn remove_workload_if(&self, key: &WorkloadKey, pred: &dyn Fn(&CachedUsageRecord) -> bool) -> CacheResult<bool>;

    /// Add to the user's running total; returns the new total.
    fn add_user_seconds(&self, user: UserId, secs: u64) -> CacheResult<u64>;

    fn user_seconds(&self, user: UserId) -> CacheResult<u64>;

    /// Subtract an amount that was flushed. The key stays alive (at zero if
    /// nothing else accrued meanwhile). Returns the remaining total.
    fn deduct_user_seconds(&self, user: UserId, secs: u64) -> CacheResult<u64>;

    /// Users with a live aggregate key.
    fn user_ids(&self) -> CacheResult<Vec<UserId>>;

    /// Drop entries whose per-key expiry has passed; returns how many.
    fn purge_expired(&self) -> CacheResult<usize>;
}

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

type WorkloadShard = FxHashMap<WorkloadKey, Entry<Vec<u8>>>;
type UserShard = FxHashMap<UserId, Entry<u64>>;

/// In-process cache striped across `shards` mutexes. Records are held in
/// their encoded (versioned) form so the schema is enforced on every read.
pub struct ShardedCache {
    workloads: Vec<Mutex<WorkloadShard>>,
    users: Vec<Mutex<UserShard>>,
    workload_ttl: chrono::Duration,
    user_ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

fn credit(shard: &mut UserShard, user: UserId, secs: u64, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> u64 {
    let entry = shard.entry(user).or_insert(Entry { value: 0, expires_at });
    if entry.expires_at <= now {
        entry.value = 0;
    }
    entry.value = entry.value.saturating_add(secs);
    entry.expires_at = expires_at;
    entry.value
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> CacheResult<MutexGuard<'a, T>> {
    m.lock().map_err(|_| CacheError::Unavailable(format!("{} stripe lock poisoned", what)))
}

impl ShardedCache {
    pub fn new(shards: usize, workload_ttl: Duration, user_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let n = shards.max(1);
        Self {
            workloads: (0..n).map(|_| Mutex::new(FxHashMap::default())).collect(),
            users: (0..n).map(|_| Mutex::new(FxHashMap::default())).collect(),
            workload_ttl: to_chrono(workload_ttl),
            user_ttl: to_chrono(user_ttl),
            clock,
        }
    }

    pub fn from_config(cfg: &MeterConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(cfg.cache_shards, cfg.workload_ttl, cfg.user_ttl, clock)
    }

    pub fn shard_count(&self) -> usize { self.workloads.len() }

    fn workload_shard(&self, key: &WorkloadKey) -> &Mutex<WorkloadShard> {
        &self.workloads[shard_of(key, self.workloads.len())]
    }

    fn user_shard(&self, user: UserId) -> &Mutex<UserShard> {
        &self.users[(user % self.users.len() as u64) as usize]
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> DateTime<Utc> {
        now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn live_record(key: &WorkloadKey, entry: Option<&Entry<Vec<u8>>>, now: DateTime<Utc>) -> Option<CachedUsageRecord> {
        let entry = entry.filter(|e| e.expires_at > now)?;
        match decode_record(&entry.value) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(key = %key, error = %e, "unreadable cached record; treating as absent");
                counter!("cache_corrupt_entries_total", 1u64);
                None
            }
        }
    }
}

impl UsageCache for ShardedCache {
    fn update_workload(
        &self,
        key: &WorkloadKey,
        f: &mut dyn FnMut(Option<&CachedUsageRecord>) -> CachedUsageRecord,
    ) -> CacheResult<CachedUsageRecord> {
        let now = self.clock.now();
        let mut shard = lock(self.workload_shard(key), "workload")?;
        let current = Self::live_record(key, shard.get(key), now);
        let next = f(current.as_ref());
        let bytes = encode_record(&next).map_err(|e| CacheError::Unavailable(format!("encoding {}: {}", key, e)))?;
        shard.insert(key.clone(), Entry { value: bytes, expires_at: self.expiry(now, self.workload_ttl) });
        Ok(next)
    }

    fn update_workload_and_credit(
        &self,
        key: &WorkloadKey,
        f: &mut dyn FnMut(Option<&CachedUsageRecord>) -> (CachedUsageRecord, u64),
    ) -> CacheResult<CachedUsageRecord> {
        let now = self.clock.now();
        // lock order: workload stripe, then user stripe
        let mut shard = lock(self.workload_shard(key), "workload")?;
        let current = Self::live_record(key, shard.get(key), now);
        let (next, secs) = f(current.as_ref());
        let bytes = encode_record(&next).map_err(|e| CacheError::Unavailable(format!("encoding {}: {}", key, e)))?;
        if secs > 0 {
            let mut users = lock(self.user_shard(next.user_id), "user")?;
            credit(&mut users, next.user_id, secs, now, self.expiry(now, self.user_ttl));
        }
        shard.insert(key.clone(), Entry { value: bytes, expires_at: self.expiry(now, self.workload_ttl) });
        Ok(next)
    }

    fn get_workload(&self, key: &WorkloadKey) -> CacheResult<Option<CachedUsageRecord>> {
        let now = self.clock.now();
        let shard = lock(self.workload_shard(key), "workload")?;
        Ok(Self::live_record(key, shard.get(key), now))
    }

    fn workload_keys(&self) -> CacheResult<Vec<WorkloadKey>> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for s in &self.workloads {
            let shard = lock(s, "workload")?;
            out.extend(shard.iter().filter(|(_, e)| e.expires_at > now).map(|(k, _)| k.clone()));
        }
        out.sort_unstable();
        Ok(out)
    }

    fn remove_workload_if(&self, key: &WorkloadKey, pred: &dyn Fn(&CachedUsageRecord) -> bool) -> CacheResult<bool> {
        let now = self.clock.now();
        let mut shard = lock(self.workload_shard(key), "workload")?;
        let matches = match Self::live_record(key, shard.get(key), now) {
            Some(r) => pred(&r),
            None => false,
        };
        if matches {
            shard.remove(key);
        }
        Ok(matches)
    }

    fn add_user_seconds(&self, user: UserId, secs: u64) -> CacheResult<u64> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, self.user_ttl);
        let mut shard = lock(self.user_shard(user), "user")?;
        Ok(credit(&mut shard, user, secs, now, expires_at))
    }

    fn user_seconds(&self, user: UserId) -> CacheResult<u64> {
        let now = self.clock.now();
        let shard = lock(self.user_shard(user), "user")?;
        Ok(shard.get(&user).filter(|e| e.expires_at > now).map(|e| e.value).unwrap_or(0))
    }

    fn deduct_user_seconds(&self, user: UserId, secs: u64) -> CacheResult<u64> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, self.user_ttl);
        let mut shard = lock(self.user_shard(user), "user")?;
        let entry = shard.entry(user).or_insert(Entry { value: 0, expires_at });
        if entry.expires_at <= now {
            entry.value = 0;
        }
        entry.value = entry.value.saturating_sub(secs);
        entry.expires_at = expires_at;
        Ok(entry.value)
    }

    fn user_ids(&self) -> CacheResult<Vec<UserId>> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for s in &self.users {
            let shard = lock(s, "user")?;
            out.extend(shard.iter().filter(|(_, e)| e.expires_at > now).map(|(k, _)| *k));
        }
        out.sort_unstable();
        Ok(out)
    }

    fn purge_expired(&self) -> CacheResult<usize> {
        let now = self.clock.now();
        let mut purged = 0usize;
        let mut remaining = 0usize;
        for s in &self.workloads {
            let mut shard = lock(s, "workload")?;
            let before = shard.len();
            shard.retain(|_, e| e.expires_at > now);
            purged += before - shard.len();
            remaining += shard.len();
        }
        for s in &self.users {
            let mut shard = lock(s, "user")?;
            let before = shard.len();
            shard.retain(|_, e| e.expires_at > now);
            purged += before - shard.len();
        }
        gauge!("cache_workload_entries", remaining as f64);
        if purged > 0 {
            debug!(purged, "expired cache entries purged");
        }
        Ok(purged)
    }
}
