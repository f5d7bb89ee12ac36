//! podmeter persistence: SQLite durable sink for flushed usage.
//! One row per workload per day (upserted) and one row per user flush event.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use metrics::{counter, histogram};
use podmeter_core::{CachedUsageRecord, UserId};
use serde::{Deserialize, Serialize};

/// Durable per-workload checkpoint for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodUsageRow {
    pub workload_id: String,
    pub namespace: String,
    pub day: NaiveDate,
    pub user_id: UserId,
    pub start_time: DateTime<Utc>,
    pub total_seconds: u64,
    pub last_update: DateTime<Utc>,
}

/// One flush of a user's accumulated seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUsageRow {
    pub id: i64,
    pub user_id: UserId,
    pub total_seconds: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Row for the day already held identical values.
    Unchanged,
}

/// Durable store as seen by the sync job. Both writes may be repeated for the
/// same logical (workload, day) without creating duplicate rows.
pub trait UsageSink: Send + Sync {
    fn upsert_daily_workload_usage(&self, day: NaiveDate, record: &CachedUsageRecord) -> Result<UpsertOutcome>;
    fn insert_user_usage_event(&self, user: UserId, total_seconds: u64, at: DateTime<Utc>) -> Result<()>;
}

/// SQLite-backed sink. Simple and synchronous; writes are small and periodic.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

fn ts(dt: DateTime<Utc>) -> i64 { dt.timestamp() }

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn parse_day(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("PODMETER_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        let started = std::time::Instant::now();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS pod_usage (
                id            INTEGER PRIMARY KEY,
                workload_id   TEXT NOT NULL,
                namespace     TEXT NOT NULL,
                day           TEXT NOT NULL,
                user_id       INTEGER NOT NULL,
                start_time    INTEGER NOT NULL,
                total_seconds INTEGER NOT NULL DEFAULT 0,
                last_update   INTEGER NOT NULL,
                created_at    INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL,
                UNIQUE (workload_id, namespace, day)
            );
            CREATE INDEX IF NOT EXISTS idx_pod_usage_user ON pod_usage(user_id, day);
            CREATE TABLE IF NOT EXISTS user_usage (
                id            INTEGER PRIMARY KEY,
                user_id       INTEGER NOT NULL,
                total_seconds INTEGER NOT NULL,
                recorded_at   INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_user_usage_user ON user_usage(user_id, recorded_at);",
        )
        .context("creating usage tables")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: std::sync::Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    /// Per-workload rows, optionally restricted to one day and/or one user.
    pub fn workload_rows(&self, day: Option<NaiveDate>, user: Option<UserId>) -> Result<Vec<PodUsageRow>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT workload_id, namespace, day, user_id, start_time, total_seconds, last_update
               FROM pod_usage
              WHERE (?1 IS NULL OR day = ?1) AND (?2 IS NULL OR user_id = ?2)
              ORDER BY day, namespace, workload_id",
        )?;
        let day_s = day.map(|d| d.format("%Y-%m-%d").to_string());
        let rows = stmt.query_map((day_s, user.map(|u| u as i64)), |row| {
            let day: String = row.get(2)?;
            Ok(PodUsageRow {
                workload_id: row.get(0)?,
                namespace: row.get(1)?,
                day: parse_day(&day)?,
                user_id: row.get::<_, i64>(3)? as UserId,
                start_time: from_ts(row.get(4)?),
                total_seconds: row.get::<_, i64>(5)?.max(0) as u64,
                last_update: from_ts(row.get(6)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn user_events(&self, user: UserId) -> Result<Vec<UserUsageRow>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, user_id, total_seconds, recorded_at FROM user_usage WHERE user_id = ?1 ORDER BY recorded_at, id",
        )?;
        let rows = stmt.query_map([user as i64], |row| {
            Ok(UserUsageRow {
                id: row.get(0)?,
                user_id: row.get::<_, i64>(1)? as UserId,
                total_seconds: row.get::<_, i64>(2)?.max(0) as u64,
                recorded_at: from_ts(row.get(3)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Sum of flushed seconds for a user recorded in `[since, until)`; either
    /// bound may be open.
    pub fn user_total(&self, user: UserId, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Result<u64> {
        let db = self.conn()?;
        let total: i64 = db.query_row(
            "SELECT COALESCE(SUM(total_seconds), 0) FROM user_usage
              WHERE user_id = ?1 AND recorded_at >= ?2 AND recorded_at < ?3",
            (user as i64, since.map(ts).unwrap_or(i64::MIN), until.map(ts).unwrap_or(i64::MAX)),
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    /// Flushed seconds recorded on one UTC calendar day.
    pub fn user_total_on(&self, user: UserId, day: NaiveDate) -> Result<u64> {
        let start = day.and_hms_opt(0, 0, 0).map(|d| Utc.from_utc_datetime(&d));
        let end = day.succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0)).map(|d| Utc.from_utc_datetime(&d));
        self.user_total(user, start, end)
    }
}

impl UsageSink for SqliteStore {
    fn upsert_daily_workload_usage(&self, day: NaiveDate, record: &CachedUsageRecord) -> Result<UpsertOutcome> {
        let started = std::time::Instant::now();
        let day_s = day.format("%Y-%m-%d").to_string();
        let now = ts(Utc::now());
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let existing: Option<(i64, i64, i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, total_seconds, last_update, start_time FROM pod_usage WHERE workload_id = ?1 AND namespace = ?2 AND day = ?3",
            )?;
            let mut rows = stmt.query((&record.workload_id, &record.namespace, &day_s))?;
            let found = match rows.next()? {
                Some(row) => Some((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                None => None,
            };
            found
        };
        let total = record.total_seconds as i64;
        let last = ts(record.last_update);
        let start = ts(record.start_time);
        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO pod_usage(workload_id, namespace, day, user_id, start_time, total_seconds, last_update, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                    (
                        &record.workload_id,
                        &record.namespace,
                        &day_s,
                        record.user_id as i64,
                        start,
                        total,
                        last,
                        now,
                    ),
                )
                .with_context(|| format!("inserting pod_usage row for {}/{}", record.namespace, record.workload_id))?;
                UpsertOutcome::Inserted
            }
            Some((_, t, l, st)) if t == total && l == last && st == start => UpsertOutcome::Unchanged,
            Some((id, _, _, _)) => {
                // a restart within the day replaces the instance the row describes
                tx.execute(
                    "UPDATE pod_usage SET start_time = ?1, total_seconds = ?2, last_update = ?3, updated_at = ?4 WHERE id = ?5",
                    (start, total, last, now, id),
                )
                .with_context(|| format!("updating pod_usage row for {}/{}", record.namespace, record.workload_id))?;
                UpsertOutcome::Updated
            }
        };
        tx.commit()?;
        histogram!("persist_upsert_ms", started.elapsed().as_secs_f64() * 1000.0);
        if outcome != UpsertOutcome::Unchanged {
            counter!("persist_pod_rows_written_total", 1u64);
        }
        Ok(outcome)
    }

    fn insert_user_usage_event(&self, user: UserId, total_seconds: u64, at: DateTime<Utc>) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO user_usage(user_id, total_seconds, recorded_at) VALUES (?1, ?2, ?3)",
            (user as i64, total_seconds as i64, ts(at)),
        )
        .with_context(|| format!("inserting user_usage event for user {}", user))?;
        histogram!("persist_user_event_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_user_events_total", 1u64);
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".podmeter");
        let _ = std::fs::create_dir_all(&p);
        p.push("podmeter.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "podmeter.db".to_string()
}
