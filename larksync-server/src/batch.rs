//! Batch upsert planner and executor.
//!
//! Projected rows are classified against the processing log into a create
//! set and an update set, because an issue is either new to the table or
//! already mapped — never both within one cycle. Creates go through the
//! sink's chunked batch call; updates go row by row (the sink has no batch
//! update), and one failed update never aborts the rest.

use std::collections::HashMap;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use larksync_core::{ApiError, LarkClient};

use crate::processing_log::ProcessingLog;

/// One projected row ready for the sink.
#[derive(Debug, Clone)]
pub struct PlannedRow {
    pub issue_key: String,
    /// The source `updated` timestamp this row was projected from.
    pub source_updated: Option<i64>,
    pub fields: Map<String, Value>,
}

/// The work split for one cycle.
#[derive(Debug)]
pub struct BatchPlan {
    pub creates: Vec<PlannedRow>,
    /// Update rows carry the sink row id they overwrite.
    pub updates: Vec<(PlannedRow, String)>,
}

/// Per-row results of executing a plan.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub created: Vec<(String, String)>,
    pub updated: Vec<(String, String)>,
    pub failed: Vec<(String, String)>,
    /// Keys whose recorded sink row vanished; their log entries were
    /// dropped and the table should re-reconcile.
    pub stale_mappings: Vec<String>,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.created.len() + self.updated.len() + self.failed.len()
    }
}

/// Classify rows into creates and updates using the processing log.
pub fn plan_operations(log: &ProcessingLog, rows: Vec<PlannedRow>) -> Result<BatchPlan> {
    let keys: Vec<String> = rows.iter().map(|r| r.issue_key.clone()).collect();
    let (known, _unknown) = log.classify(&keys)?;
    Ok(split_rows(rows, &known))
}

/// Split rows by an explicit key → sink row id map. Full refresh passes the
/// map built from a fresh sink scan, which is more current than the log.
pub fn split_rows(rows: Vec<PlannedRow>, known: &HashMap<String, String>) -> BatchPlan {
    let mut creates = Vec::new();
    let mut updates = Vec::new();
    for row in rows {
        match known.get(&row.issue_key) {
            Some(record_id) => updates.push((row, record_id.clone())),
            None => creates.push(row),
        }
    }

    info!(
        "batch plan: {} creates, {} updates",
        creates.len(),
        updates.len()
    );
    BatchPlan { creates, updates }
}

/// Execute a plan against the sink. Partial failure is expected: each row
/// ends up in exactly one of `created`/`updated`/`failed`.
pub async fn execute_plan(
    lark: &LarkClient,
    app_token: &str,
    table_id: &str,
    log: &ProcessingLog,
    plan: BatchPlan,
) -> Result<BatchOutcome> {
    let mut outcome = BatchOutcome::default();

    if !plan.creates.is_empty() {
        let fields: Vec<Map<String, Value>> =
            plan.creates.iter().map(|row| row.fields.clone()).collect();
        let results = lark.batch_create(app_token, table_id, &fields).await;

        for (row, result) in plan.creates.iter().zip(results) {
            match result {
                Ok(record_id) => outcome.created.push((row.issue_key.clone(), record_id)),
                Err(reason) => {
                    error!("create failed for {}: {}", row.issue_key, reason);
                    outcome.failed.push((row.issue_key.clone(), reason));
                }
            }
        }
    }

    for (row, record_id) in &plan.updates {
        match lark
            .update_record(app_token, table_id, record_id, &row.fields)
            .await
        {
            Ok(()) => outcome
                .updated
                .push((row.issue_key.clone(), record_id.clone())),
            Err(ApiError::RecordNotFound(_)) => {
                // The sink row was deleted behind our back. Drop the stale
                // mapping; a full refresh or the next cold start rebuilds it.
                warn!(
                    "sink row {} for {} no longer exists; dropping stale mapping",
                    record_id, row.issue_key
                );
                if let Err(err) = log.remove(&row.issue_key) {
                    error!(
                        "failed to drop stale mapping for {}: {}",
                        row.issue_key, err
                    );
                }
                outcome.stale_mappings.push(row.issue_key.clone());
                outcome.failed.push((
                    row.issue_key.clone(),
                    format!("sink row {} not found", record_id),
                ));
            }
            Err(err) => {
                error!("update failed for {}: {}", row.issue_key, err);
                outcome
                    .failed
                    .push((row.issue_key.clone(), err.to_string()));
            }
        }
    }

    info!(
        "batch execution: {} created, {} updated, {} failed",
        outcome.created.len(),
        outcome.updated.len(),
        outcome.failed.len()
    );
    Ok(outcome)
}

/// Index planned rows by key, for writing outcomes back to the log.
pub fn rows_by_key(plan: &BatchPlan) -> HashMap<String, Option<i64>> {
    plan.creates
        .iter()
        .map(|row| (row.issue_key.clone(), row.source_updated))
        .chain(
            plan.updates
                .iter()
                .map(|(row, _)| (row.issue_key.clone(), row.source_updated)),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing_log::{LogEntry, Outcome};
    use serde_json::json;

    fn row(key: &str) -> PlannedRow {
        let mut fields = Map::new();
        fields.insert("Title".to_string(), json!("x"));
        PlannedRow {
            issue_key: key.to_string(),
            source_updated: Some(100),
            fields,
        }
    }

    #[test]
    fn test_plan_splits_known_and_unknown() {
        let log = ProcessingLog::open_in_memory("tbl").unwrap();
        log.record(&[LogEntry {
            issue_key: "TP-1".to_string(),
            source_updated: 50,
            sink_record_id: Some("row_a".to_string()),
            outcome: Outcome::Created,
        }])
        .unwrap();

        let plan = plan_operations(&log, vec![row("TP-1"), row("TP-2")]).unwrap();
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].1, "row_a");
        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.creates[0].issue_key, "TP-2");
    }

    #[test]
    fn test_plan_treats_failed_rows_without_id_as_creates() {
        let log = ProcessingLog::open_in_memory("tbl").unwrap();
        log.record(&[LogEntry {
            issue_key: "TP-9".to_string(),
            source_updated: 0,
            sink_record_id: None,
            outcome: Outcome::Failed,
        }])
        .unwrap();

        let plan = plan_operations(&log, vec![row("TP-9")]).unwrap();
        assert_eq!(plan.creates.len(), 1);
        assert!(plan.updates.is_empty());
    }

    #[test]
    fn test_rows_by_key_covers_both_sets() {
        let plan = BatchPlan {
            creates: vec![row("TP-1")],
            updates: vec![(row("TP-2"), "row_b".to_string())],
        };
        let index = rows_by_key(&plan);
        assert_eq!(index.len(), 2);
        assert_eq!(index["TP-1"], Some(100));
        assert_eq!(index["TP-2"], Some(100));
    }
}
