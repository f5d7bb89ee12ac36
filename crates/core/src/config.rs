//! Runtime configuration with `PODMETER_*` environment overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Active-workload poller cadence.
    pub poll_interval: Duration,
    /// Durability sync cadence.
    pub sync_interval: Duration,
    /// Retention sweep cadence.
    pub sweep_interval: Duration,
    /// Workload records idle longer than this are evicted by the sweep.
    pub retention: Duration,
    /// Upper bound on waiting for in-flight jobs during shutdown.
    pub drain_timeout: Duration,
    /// A workload counts as active if updated within this window.
    pub active_window: Duration,
    /// Per-key expiry of workload records, refreshed on every write.
    pub workload_ttl: Duration,
    /// Per-key expiry of user aggregates, refreshed on every write.
    pub user_ttl: Duration,
    /// Per-user namespaces are named `<prefix><user_id>`.
    pub namespace_prefix: String,
    /// Lock stripes in the in-memory cache.
    pub cache_shards: usize,
    pub ingest_backoff_initial: Duration,
    pub ingest_backoff_max: Duration,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            sync_interval: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(24 * 3600),
            retention: Duration::from_secs(7 * 24 * 3600),
            drain_timeout: Duration::from_secs(10),
            active_window: Duration::from_secs(5 * 60),
            workload_ttl: Duration::from_secs(8 * 24 * 3600),
            user_ttl: Duration::from_secs(24 * 3600),
            namespace_prefix: "ns-".to_string(),
            cache_shards: 16,
            ingest_backoff_initial: Duration::from_millis(200),
            ingest_backoff_max: Duration::from_secs(5),
        }
    }
}

impl MeterConfig {
    /// Defaults overridden by `PODMETER_*` variables. Unparseable values keep
    /// the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let secs = |k: &str, def: Duration| {
            get(k).and_then(|s| s.trim().parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(def)
        };
        let millis = |k: &str, def: Duration| {
            get(k).and_then(|s| s.trim().parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(def)
        };
        Self {
            poll_interval: secs("PODMETER_POLL_SECS", d.poll_interval),
            sync_interval: secs("PODMETER_SYNC_SECS", d.sync_interval),
            sweep_interval: secs("PODMETER_SWEEP_SECS", d.sweep_interval),
            retention: secs("PODMETER_RETENTION_SECS", d.retention),
            drain_timeout: secs("PODMETER_DRAIN_TIMEOUT_SECS", d.drain_timeout),
            active_window: secs("PODMETER_ACTIVE_WINDOW_SECS", d.active_window),
            workload_ttl: secs("PODMETER_WORKLOAD_TTL_SECS", d.workload_ttl),
            user_ttl: secs("PODMETER_USER_TTL_SECS", d.user_ttl),
            namespace_prefix: get("PODMETER_NAMESPACE_PREFIX").filter(|s| !s.is_empty()).unwrap_or(d.namespace_prefix),
            cache_shards: get("PODMETER_CACHE_SHARDS").and_then(|s| s.trim().parse().ok()).unwrap_or(d.cache_shards),
            ingest_backoff_initial: millis("PODMETER_INGEST_BACKOFF_MS", d.ingest_backoff_initial),
            ingest_backoff_max: millis("PODMETER_INGEST_BACKOFF_MAX_MS", d.ingest_backoff_max),
        }
        .normalized()
    }

    /// Clamp values that would make a ticker or the cache degenerate.
    pub fn normalized(mut self) -> Self {
        let min = Duration::from_millis(10);
        self.poll_interval = self.poll_interval.max(min);
        self.sync_interval = self.sync_interval.max(min);
        self.sweep_interval = self.sweep_interval.max(min);
        self.cache_shards = self.cache_shards.clamp(1, 1024);
        self.ingest_backoff_max = self.ingest_backoff_max.max(self.ingest_backoff_initial);
        self
    }

    /// Namespace owned by `user_id` under the configured convention.
    pub fn namespace_for(&self, user_id: crate::UserId) -> String {
        format!("{}{}", self.namespace_prefix, user_id)
    }
}
