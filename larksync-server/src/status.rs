//! Status surface: per-table sync state plus the pending-user backlog,
//! serializable for the CLI (and anything else that wants JSON).

use anyhow::Result;
use serde::Serialize;

use crate::processing_log::LogStats;
use crate::SyncContext;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub generated_at: String,
    pub pending_users: usize,
    pub teams: Vec<TeamStatus>,
}

#[derive(Debug, Serialize)]
pub struct TeamStatus {
    pub team: String,
    pub tables: Vec<TableStatus>,
}

#[derive(Debug, Serialize)]
pub struct TableStatus {
    pub table: String,
    pub table_id: String,
    pub interval_secs: u64,
    #[serde(flatten)]
    pub stats: LogStats,
    /// Last successful activity, human-readable.
    pub last_processed: Option<String>,
}

/// Build the report from the processing logs and the user cache.
pub fn build_status(ctx: &SyncContext) -> Result<StatusReport> {
    let config = ctx.config();
    let mut teams: Vec<TeamStatus> = Vec::new();

    for binding in config.enabled_bindings() {
        let log = ctx.processing_log(&binding.table_id)?;
        let stats = log.stats()?;
        let last_processed = stats.last_processed_at.and_then(format_ms);

        let table_status = TableStatus {
            table: binding.table.clone(),
            table_id: binding.table_id.clone(),
            interval_secs: binding.interval.as_secs(),
            stats,
            last_processed,
        };

        match teams.iter_mut().find(|t| t.team == binding.team) {
            Some(team) => team.tables.push(table_status),
            None => teams.push(TeamStatus {
                team: binding.team.clone(),
                tables: vec![table_status],
            }),
        }
    }

    Ok(StatusReport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        pending_users: ctx.user_cache.pending_count()?,
        teams,
    })
}

fn format_ms(ms: i64) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(ms).map(|dt| dt.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ms() {
        let formatted = format_ms(1720510200000).unwrap();
        assert!(formatted.starts_with("2024-07-09T07:30:00"));
        assert!(format_ms(i64::MAX).is_none());
    }
}
