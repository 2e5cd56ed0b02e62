//! Per-table processing log: the durable index of what has been synced.
//!
//! One SQLite file per table maps each issue key to the source `updated`
//! timestamp it was last synced at, the sink row it landed in, and the
//! outcome. The log is written only after the corresponding sink write in
//! the same cycle, so a crash between the two makes the next cycle re-apply
//! the issue — harmless, because the sink write is an idempotent overwrite
//! keyed by row id.
//!
//! # Schema Versioning
//!
//! Tracked with SQLite's `user_version` pragma; bump `SCHEMA_VERSION` and
//! extend `run_migrations` for changes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
const SCHEMA_VERSION: i32 = 1;

/// Sentinel `source_updated` value: forces the next cycle to treat the entry
/// as stale. Cold start records every scanned row with it.
pub const COLD_START_SENTINEL: i64 = 0;

/// A log idle longer than this re-runs cold start, in case the sink drifted
/// while nobody was syncing.
const COLD_START_IDLE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    ColdStartExisting,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::ColdStartExisting => "cold_start_existing",
            Outcome::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "created" => Ok(Outcome::Created),
            "updated" => Ok(Outcome::Updated),
            "cold_start_existing" => Ok(Outcome::ColdStartExisting),
            "failed" => Ok(Outcome::Failed),
            other => Err(anyhow!("unknown outcome: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub issue_key: String,
    pub source_updated: i64,
    pub sink_record_id: Option<String>,
    pub outcome: Outcome,
}

/// Aggregates for the status surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LogStats {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub cold_start_existing: usize,
    pub last_processed_at: Option<i64>,
}

/// The processing log for one table. Single-writer per table is enforced by
/// the coordinator; the mutex only serializes the connection.
pub struct ProcessingLog {
    conn: Mutex<Connection>,
    table_id: String,
}

impl ProcessingLog {
    /// Open (or create) the log for a table under the data directory.
    pub fn open(data_dir: &Path, table_id: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        let path = Self::db_path(data_dir, table_id);
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open processing log at {:?}", path))?;
        let log = Self {
            conn: Mutex::new(conn),
            table_id: table_id.to_string(),
        };
        log.init_schema()?;
        Ok(log)
    }

    /// In-memory log (for testing).
    pub fn open_in_memory(table_id: &str) -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory processing log")?;
        let log = Self {
            conn: Mutex::new(conn),
            table_id: table_id.to_string(),
        };
        log.init_schema()?;
        Ok(log)
    }

    pub fn db_path(data_dir: &Path, table_id: &str) -> PathBuf {
        data_dir.join(format!("processing_log_{}.db", table_id))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Processing log schema version {} is newer than supported version {}",
                current_version,
                SCHEMA_VERSION
            );
        }
        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS processing_log (
                    issue_key TEXT PRIMARY KEY,
                    source_updated INTEGER NOT NULL,
                    sink_record_id TEXT,
                    outcome TEXT NOT NULL CHECK(outcome IN (
                        'created', 'updated', 'cold_start_existing', 'failed'
                    )),
                    processed_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_processing_log_source_updated
                ON processing_log (source_updated);

                CREATE INDEX IF NOT EXISTS idx_processing_log_processed_at
                ON processing_log (processed_at);
                "#,
            )
            .context("Failed to create processing log schema (v0 -> v1)")?;
        }
        Ok(())
    }

    /// Whether cold start has ever run for this table.
    pub fn is_initialized(&self) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM processing_log", [], |row| row.get(0))
            .context("Failed to count processing log rows")?;
        Ok(count > 0)
    }

    /// Whether the next cycle must run cold start: the log is uninitialized
    /// or has been idle past the staleness window.
    pub fn needs_cold_start(&self, now_ms: i64) -> Result<bool> {
        if !self.is_initialized()? {
            info!("table {}: empty processing log, cold start needed", self.table_id);
            return Ok(true);
        }
        let conn = self.conn.lock().expect("mutex poisoned");
        let last: Option<i64> = conn
            .query_row(
                "SELECT MAX(processed_at) FROM processing_log",
                [],
                |row| row.get(0),
            )
            .context("Failed to read last processed time")?;
        if let Some(last) = last {
            if now_ms - last > COLD_START_IDLE_MS {
                info!(
                    "table {}: log idle for {} ms, cold start needed",
                    self.table_id,
                    now_ms - last
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Keep the candidates that are stale: no entry, a newer source
    /// timestamp than recorded, or an unreadable timestamp (fail open —
    /// syncing twice is harmless, skipping is not).
    pub fn filter_stale(
        &self,
        candidates: &[(String, Option<i64>)],
    ) -> Result<HashSet<String>> {
        let recorded = self.load_timestamps()?;

        let mut stale = HashSet::new();
        for (key, updated) in candidates {
            let is_stale = match (recorded.get(key), updated) {
                (None, _) => true,
                (Some(_), None) => true,
                (Some(last), Some(updated)) => *updated > *last,
            };
            if is_stale {
                stale.insert(key.clone());
            } else {
                debug!("skipping unchanged issue {}", key);
            }
        }

        info!(
            "table {}: staleness filter kept {} of {} issues",
            self.table_id,
            stale.len(),
            candidates.len()
        );
        Ok(stale)
    }

    fn load_timestamps(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT issue_key, source_updated FROM processing_log")
            .context("Failed to prepare timestamp query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query timestamps")?;

        let mut map = HashMap::new();
        for row in rows {
            let (key, updated) = row.context("Failed to read row")?;
            map.insert(key, updated);
        }
        Ok(map)
    }

    /// Split keys into those with a known sink row (to update) and the rest
    /// (to create).
    pub fn classify(
        &self,
        keys: &[String],
    ) -> Result<(HashMap<String, String>, Vec<String>)> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT issue_key, sink_record_id FROM processing_log \
                 WHERE sink_record_id IS NOT NULL AND sink_record_id != ''",
            )
            .context("Failed to prepare classify query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query record ids")?;

        let mut all_known = HashMap::new();
        for row in rows {
            let (key, record_id) = row.context("Failed to read row")?;
            all_known.insert(key, record_id);
        }

        let mut known = HashMap::new();
        let mut unknown = Vec::new();
        for key in keys {
            match all_known.get(key) {
                Some(record_id) => {
                    known.insert(key.clone(), record_id.clone());
                }
                None => unknown.push(key.clone()),
            }
        }
        Ok((known, unknown))
    }

    /// Idempotent upsert of cycle outcomes, in one transaction.
    pub fn record(&self, entries: &[LogEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let now = chrono::Utc::now().timestamp_millis();

        let tx = conn.transaction().context("Failed to begin transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO processing_log \
                     (issue_key, source_updated, sink_record_id, outcome, processed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT (issue_key) DO UPDATE SET \
                        source_updated = excluded.source_updated, \
                        sink_record_id = excluded.sink_record_id, \
                        outcome = excluded.outcome, \
                        processed_at = excluded.processed_at",
                )
                .context("Failed to prepare record statement")?;
            for entry in entries {
                stmt.execute(rusqlite::params![
                    &entry.issue_key,
                    entry.source_updated,
                    &entry.sink_record_id,
                    entry.outcome.as_str(),
                    now,
                ])
                .with_context(|| format!("Failed to record entry for {}", entry.issue_key))?;
            }
        }
        tx.commit().context("Failed to commit record transaction")?;

        debug!("table {}: recorded {} entries", self.table_id, entries.len());
        Ok(entries.len())
    }

    /// The recorded sink row id for a key, if any.
    pub fn sink_record_id(&self, issue_key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        use rusqlite::OptionalExtension;
        let id: Option<Option<String>> = conn
            .query_row(
                "SELECT sink_record_id FROM processing_log WHERE issue_key = ?1",
                [issue_key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query sink record id")?;
        Ok(id.flatten())
    }

    /// Drop one entry. Returns whether an entry existed.
    pub fn remove(&self, issue_key: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let removed = conn
            .execute(
                "DELETE FROM processing_log WHERE issue_key = ?1",
                [issue_key],
            )
            .context("Failed to remove processing log entry")?;
        Ok(removed > 0)
    }

    /// Wipe the log. The next cycle cold-starts from the live sink table.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let removed = conn
            .execute("DELETE FROM processing_log", [])
            .context("Failed to clear processing log")?;
        info!("table {}: cleared {} log entries", self.table_id, removed);
        Ok(removed)
    }

    pub fn stats(&self) -> Result<LogStats> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT outcome, COUNT(*) FROM processing_log GROUP BY outcome")
            .context("Failed to prepare stats query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query stats")?;

        let mut stats = LogStats::default();
        for row in rows {
            let (outcome, count) = row.context("Failed to read row")?;
            let count = count as usize;
            stats.total += count;
            match Outcome::parse(&outcome)? {
                Outcome::Created => stats.created = count,
                Outcome::Updated => stats.updated = count,
                Outcome::ColdStartExisting => stats.cold_start_existing = count,
                Outcome::Failed => stats.failed = count,
            }
        }
        stats.last_processed_at = conn
            .query_row(
                "SELECT MAX(processed_at) FROM processing_log",
                [],
                |row| row.get(0),
            )
            .context("Failed to read last processed time")?;
        Ok(stats)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> ProcessingLog {
        ProcessingLog::open_in_memory("tbl_test").expect("should create in-memory log")
    }

    fn entry(key: &str, updated: i64, record_id: Option<&str>, outcome: Outcome) -> LogEntry {
        LogEntry {
            issue_key: key.to_string(),
            source_updated: updated,
            sink_record_id: record_id.map(str::to_string),
            outcome,
        }
    }

    #[test]
    fn test_uninitialized_log_needs_cold_start() {
        let log = log();
        assert!(!log.is_initialized().unwrap());
        assert!(log.needs_cold_start(chrono::Utc::now().timestamp_millis()).unwrap());
    }

    #[test]
    fn test_initialized_fresh_log_skips_cold_start() {
        let log = log();
        log.record(&[entry("TP-1", 100, Some("row_a"), Outcome::Created)])
            .unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        assert!(log.is_initialized().unwrap());
        assert!(!log.needs_cold_start(now).unwrap());
        // An idle log past the window cold-starts again.
        assert!(log.needs_cold_start(now + 8 * 24 * 60 * 60 * 1000).unwrap());
    }

    #[test]
    fn test_filter_stale_no_entry_is_stale() {
        let log = log();
        let stale = log
            .filter_stale(&[("TP-1".to_string(), Some(100))])
            .unwrap();
        assert!(stale.contains("TP-1"));
    }

    #[test]
    fn test_filter_stale_newer_timestamp_is_stale() {
        let log = log();
        log.record(&[entry("TP-1", 100, Some("row_a"), Outcome::Created)])
            .unwrap();

        let stale = log
            .filter_stale(&[
                ("TP-1".to_string(), Some(100)),
                ("TP-2".to_string(), Some(50)),
            ])
            .unwrap();
        assert!(!stale.contains("TP-1"), "equal timestamp is not stale");
        assert!(stale.contains("TP-2"));

        let stale = log
            .filter_stale(&[("TP-1".to_string(), Some(101))])
            .unwrap();
        assert!(stale.contains("TP-1"));
    }

    #[test]
    fn test_filter_stale_unparseable_timestamp_fails_open() {
        let log = log();
        log.record(&[entry("TP-1", 100, Some("row_a"), Outcome::Created)])
            .unwrap();
        let stale = log.filter_stale(&[("TP-1".to_string(), None)]).unwrap();
        assert!(stale.contains("TP-1"));
    }

    #[test]
    fn test_cold_start_sentinel_is_always_stale() {
        let log = log();
        log.record(&[entry(
            "TP-1",
            COLD_START_SENTINEL,
            Some("row_a"),
            Outcome::ColdStartExisting,
        )])
        .unwrap();
        let stale = log.filter_stale(&[("TP-1".to_string(), Some(1))]).unwrap();
        assert!(stale.contains("TP-1"));
    }

    #[test]
    fn test_record_then_filter_same_timestamps_is_empty() {
        // record(entries) followed by filter_stale(same timestamps) yields
        // the empty set.
        let log = log();
        log.record(&[
            entry("TP-1", 100, Some("row_a"), Outcome::Created),
            entry("TP-2", 200, Some("row_b"), Outcome::Updated),
        ])
        .unwrap();

        let stale = log
            .filter_stale(&[
                ("TP-1".to_string(), Some(100)),
                ("TP-2".to_string(), Some(200)),
            ])
            .unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn test_classify_splits_known_and_unknown() {
        let log = log();
        log.record(&[
            entry("TP-1", 100, Some("row_a"), Outcome::Created),
            entry("TP-2", 100, None, Outcome::Failed),
        ])
        .unwrap();

        let (known, unknown) = log
            .classify(&[
                "TP-1".to_string(),
                "TP-2".to_string(),
                "TP-3".to_string(),
            ])
            .unwrap();
        assert_eq!(known.get("TP-1"), Some(&"row_a".to_string()));
        assert_eq!(unknown, vec!["TP-2".to_string(), "TP-3".to_string()]);
    }

    #[test]
    fn test_record_is_idempotent_upsert() {
        let log = log();
        log.record(&[entry("TP-1", 100, Some("row_a"), Outcome::Created)])
            .unwrap();
        log.record(&[entry("TP-1", 200, Some("row_a"), Outcome::Updated)])
            .unwrap();

        let stats = log.stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.created, 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let log = log();
        log.record(&[
            entry("TP-1", 100, Some("row_a"), Outcome::Created),
            entry("TP-2", 100, Some("row_b"), Outcome::Created),
        ])
        .unwrap();

        assert!(log.remove("TP-1").unwrap());
        assert!(!log.remove("TP-1").unwrap());
        assert_eq!(log.clear().unwrap(), 1);
        assert!(!log.is_initialized().unwrap());
    }

    #[test]
    fn test_stats_counts_outcomes() {
        let log = log();
        log.record(&[
            entry("TP-1", 100, Some("row_a"), Outcome::Created),
            entry("TP-2", 100, Some("row_b"), Outcome::Updated),
            entry("TP-3", 0, None, Outcome::Failed),
            entry("TP-4", 0, Some("row_c"), Outcome::ColdStartExisting),
        ])
        .unwrap();

        let stats = log.stats().unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cold_start_existing, 1);
        assert!(stats.last_processed_at.is_some());
    }

    #[test]
    fn test_sink_record_id_lookup() {
        let log = log();
        log.record(&[
            entry("TP-1", 100, Some("row_a"), Outcome::Created),
            entry("TP-2", 0, None, Outcome::Failed),
        ])
        .unwrap();
        assert_eq!(log.sink_record_id("TP-1").unwrap(), Some("row_a".to_string()));
        assert_eq!(log.sink_record_id("TP-2").unwrap(), None);
        assert_eq!(log.sink_record_id("TP-9").unwrap(), None);
    }
}
