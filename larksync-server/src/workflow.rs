//! One sync cycle for one table binding.
//!
//! A cycle is a unit: its results are reflected in the processing log only
//! after the corresponding sink writes succeeded, so an aborted cycle leaves
//! the log untouched and the next tick reconstructs the same work.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::{error, info, warn};

use larksync_core::{
    build_plan, required_source_fields, FieldMapping, Issue, Record, SinkField,
};

use crate::batch::{execute_plan, plan_operations, rows_by_key, split_rows, PlannedRow};
use crate::config::Binding;
use crate::processing_log::{LogEntry, Outcome, ProcessingLog, COLD_START_SENTINEL};
use crate::SyncContext;

/// How a cycle selects and filters its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleMode {
    /// Scheduled operation: query the source filter, sync what is stale.
    Incremental,
    /// Operator-triggered: scan the sink, re-fetch those keys from the
    /// source, and overwrite them all, bypassing the staleness filter.
    FullRefresh,
    /// Re-fetch and upsert a single issue key.
    SingleIssue(String),
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub team: String,
    pub table: String,
    pub cold_start: bool,
    /// Issues matched by the source query (or key scan).
    pub matched: usize,
    /// Issues that survived the staleness filter.
    pub stale: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl CycleOutcome {
    pub fn had_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Run one cycle for one binding.
pub async fn run_cycle(
    ctx: &SyncContext,
    binding: &Binding,
    mode: CycleMode,
) -> Result<CycleOutcome> {
    let started = Instant::now();
    let config = ctx.config();
    info!(
        "cycle start: {}/{} (table {}, mode {:?})",
        binding.team, binding.table, binding.table_id, mode
    );

    let app_token = ctx
        .lark
        .resolve_app_token(&binding.wiki_token)
        .await
        .with_context(|| format!("Failed to resolve workspace for {}", binding.team))?;
    let table_fields = ctx
        .lark
        .list_fields(&app_token, &binding.table_id)
        .await
        .with_context(|| format!("Failed to list columns of {}", binding.table_id))?;

    let mappings = mappings_for_binding(&config.field_mappings, binding.ticket_field.as_deref());
    let plan = build_plan(&mappings, &table_fields, &binding.excluded_fields).map_err(|err| {
        anyhow!(
            "configuration error for {}/{}: {}",
            binding.team,
            binding.table,
            err
        )
    })?;
    let required_fields = required_source_fields(&mappings);
    let log = ctx.processing_log(&binding.table_id)?;

    // Cold start: register what already lives in the sink so incremental
    // classification can tell updates from creates.
    let mut cold_start = false;
    if mode == CycleMode::Incremental {
        let requested = ctx.take_cold_start_request(&binding.table_id);
        let now_ms = chrono::Utc::now().timestamp_millis();
        if requested || log.needs_cold_start(now_ms)? {
            cold_start = true;
            run_cold_start(ctx, &app_token, binding, &plan.identity_column, &log).await?;
        }
    }

    // Gather input issues and, for full refresh, the fresh key → row map.
    let mut scanned_rows: Option<HashMap<String, String>> = None;
    let issues: HashMap<String, Issue> = match &mode {
        CycleMode::Incremental => ctx
            .jira
            .search(&binding.jql, &required_fields)
            .await
            .context("Source search failed")?,
        CycleMode::FullRefresh => {
            let records = ctx
                .lark
                .scan(&app_token, &binding.table_id)
                .await
                .context("Sink scan failed")?;
            let pairs = extract_identity_pairs(&records, &plan.identity_column);
            info!(
                "full refresh: {} keys extracted from {} sink rows",
                pairs.len(),
                records.len()
            );
            let keys: Vec<String> = pairs.keys().cloned().collect();
            scanned_rows = Some(pairs);
            if keys.is_empty() {
                HashMap::new()
            } else {
                ctx.jira
                    .search_keys(&keys, &required_fields)
                    .await
                    .context("Source fetch by key list failed")?
            }
        }
        CycleMode::SingleIssue(key) => {
            let issue = ctx
                .jira
                .get(key, &required_fields)
                .await
                .context("Source fetch failed")?;
            match issue {
                Some(issue) => HashMap::from([(issue.key.clone(), issue)]),
                None => bail!("issue {} not found in source", key),
            }
        }
    };
    let matched = issues.len();

    // Staleness filter. Only the scheduled path filters; full refresh and
    // single-issue syncs overwrite unconditionally.
    let stale_keys: HashSet<String> = match mode {
        CycleMode::Incremental => {
            let candidates: Vec<(String, Option<i64>)> = issues
                .values()
                .map(|issue| (issue.key.clone(), issue.updated_ms()))
                .collect();
            log.filter_stale(&candidates)?
        }
        _ => issues.keys().cloned().collect(),
    };

    // Projection. A field failure nulls the field inside the processor; an
    // identity failure drops the issue to the failed set.
    let mut planned = Vec::new();
    let mut projection_failures: Vec<(String, String)> = Vec::new();
    for issue in issues.values() {
        if !stale_keys.contains(&issue.key) {
            continue;
        }
        match ctx.field_processor.project(issue, &plan) {
            Ok(fields) => planned.push(PlannedRow {
                issue_key: issue.key.clone(),
                source_updated: issue.updated_ms(),
                fields,
            }),
            Err(err) => {
                error!("projection failed for {}: {}", issue.key, err);
                projection_failures.push((issue.key.clone(), err.to_string()));
            }
        }
    }

    // Classify and execute. Full refresh trusts the scan it just did over
    // the log, which repairs mappings the log has lost or gotten wrong.
    let batch_plan = match &scanned_rows {
        Some(known) => split_rows(planned, known),
        None => plan_operations(&log, planned)?,
    };
    let timestamps = rows_by_key(&batch_plan);
    let outcome = execute_plan(&ctx.lark, &app_token, &binding.table_id, &log, batch_plan).await?;

    if !outcome.stale_mappings.is_empty() {
        warn!(
            "{} stale sink mappings in {}; requesting cold start",
            outcome.stale_mappings.len(),
            binding.table_id
        );
        ctx.request_cold_start(&binding.table_id);
    }

    // Record outcomes. Successful keys carry the source timestamp they were
    // projected from; failed keys carry the sentinel so the next cycle
    // retries them.
    let mut entries = Vec::new();
    for (key, record_id) in &outcome.created {
        entries.push(LogEntry {
            issue_key: key.clone(),
            source_updated: timestamps.get(key).copied().flatten().unwrap_or(0),
            sink_record_id: Some(record_id.clone()),
            outcome: Outcome::Created,
        });
    }
    for (key, record_id) in &outcome.updated {
        entries.push(LogEntry {
            issue_key: key.clone(),
            source_updated: timestamps.get(key).copied().flatten().unwrap_or(0),
            sink_record_id: Some(record_id.clone()),
            outcome: Outcome::Updated,
        });
    }
    for (key, _) in &outcome.failed {
        let kept_id = if outcome.stale_mappings.contains(key) {
            None
        } else {
            log.sink_record_id(key)?
        };
        entries.push(LogEntry {
            issue_key: key.clone(),
            source_updated: COLD_START_SENTINEL,
            sink_record_id: kept_id,
            outcome: Outcome::Failed,
        });
    }
    for (key, _) in &projection_failures {
        entries.push(LogEntry {
            issue_key: key.clone(),
            source_updated: COLD_START_SENTINEL,
            sink_record_id: log.sink_record_id(key)?,
            outcome: Outcome::Failed,
        });
    }
    log.record(&entries)?;

    let result = CycleOutcome {
        team: binding.team.clone(),
        table: binding.table.clone(),
        cold_start,
        matched,
        stale: stale_keys.len(),
        created: outcome.created.len(),
        updated: outcome.updated.len(),
        failed: outcome.failed.len() + projection_failures.len(),
        duration: started.elapsed(),
    };
    info!(
        "cycle done: {}/{} matched {} stale {} created {} updated {} failed {} in {:?}",
        result.team,
        result.table,
        result.matched,
        result.stale,
        result.created,
        result.updated,
        result.failed,
        result.duration
    );
    Ok(result)
}

/// Register every existing sink row in the processing log with the
/// cold-start sentinel, so the following incremental pass treats everything
/// as stale and converges without creating duplicates.
async fn run_cold_start(
    ctx: &SyncContext,
    app_token: &str,
    binding: &Binding,
    identity_column: &str,
    log: &ProcessingLog,
) -> Result<()> {
    let records = ctx
        .lark
        .scan(app_token, &binding.table_id)
        .await
        .context("Sink scan for cold start failed")?;
    let pairs = extract_identity_pairs(&records, identity_column);

    let entries: Vec<LogEntry> = pairs
        .iter()
        .map(|(key, record_id)| LogEntry {
            issue_key: key.clone(),
            source_updated: COLD_START_SENTINEL,
            sink_record_id: Some(record_id.clone()),
            outcome: Outcome::ColdStartExisting,
        })
        .collect();
    let recorded = log.record(&entries)?;

    info!(
        "cold start for {}: registered {} of {} sink rows",
        binding.table_id,
        recorded,
        records.len()
    );
    Ok(())
}

/// Extract `(issue_key, record_id)` pairs from scanned sink rows via the
/// identity column. Rows whose identity cell does not look like an issue
/// key are skipped.
fn extract_identity_pairs(
    records: &[Record],
    identity_column: &str,
) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    for record in records {
        let Some(value) = record.fields.get(identity_column) else {
            continue;
        };
        if let Some(key) = extract_issue_key(value) {
            pairs.insert(key, record.record_id.clone());
        }
    }
    pairs
}

/// Pull an issue key out of an identity cell, which may be plain text, a
/// hyperlink object, or an array of either.
fn extract_issue_key(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj
            .get("text")
            .or_else(|| obj.get("link"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::Array(items) => items.first().and_then(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }),
        _ => None,
    }?;

    let text = text.trim();
    // A key always has a project prefix and a number around a dash. URLs
    // from link cells end in the key, so take the last path segment first.
    let candidate = text.rsplit('/').next().unwrap_or(text).trim();
    (!candidate.is_empty() && candidate.contains('-')).then(|| candidate.to_string())
}

/// The schema for one binding: a per-table identity column override is
/// prepended to the identity mapping's candidate list.
fn mappings_for_binding(
    mappings: &std::collections::BTreeMap<String, FieldMapping>,
    ticket_field: Option<&str>,
) -> std::collections::BTreeMap<String, FieldMapping> {
    let mut mappings = mappings.clone();
    let Some(ticket_field) = ticket_field else {
        return mappings;
    };

    for mapping in mappings.values_mut() {
        if mapping.processor == larksync_core::Processor::ExtractTicketLink {
            let mut candidates = vec![ticket_field.to_string()];
            match &mapping.lark_field {
                SinkField::Name(name) => candidates.push(name.clone()),
                SinkField::Candidates(names) => candidates.extend(names.iter().cloned()),
            }
            mapping.lark_field = SinkField::Candidates(candidates);
        }
    }
    mappings
}

#[cfg(test)]
mod tests {
    use super::*;
    use larksync_core::Processor;
    use serde_json::json;

    fn record(id: &str, identity_column: &str, value: Value) -> Record {
        let mut fields = serde_json::Map::new();
        fields.insert(identity_column.to_string(), value);
        Record {
            record_id: id.to_string(),
            fields,
        }
    }

    #[test]
    fn test_extract_issue_key_variants() {
        assert_eq!(extract_issue_key(&json!("TP-1")), Some("TP-1".to_string()));
        assert_eq!(
            extract_issue_key(&json!({ "text": "TP-2", "link": "https://x/browse/TP-2" })),
            Some("TP-2".to_string())
        );
        assert_eq!(
            extract_issue_key(&json!({ "link": "https://x/browse/TP-3" })),
            Some("TP-3".to_string())
        );
        assert_eq!(
            extract_issue_key(&json!([{ "text": "TP-4" }])),
            Some("TP-4".to_string())
        );
        assert_eq!(extract_issue_key(&json!(["TP-5"])), Some("TP-5".to_string()));
        assert_eq!(extract_issue_key(&json!("not a key")), None);
        assert_eq!(extract_issue_key(&json!(42)), None);
    }

    #[test]
    fn test_extract_identity_pairs_skips_unusable_rows() {
        let records = vec![
            record("row_a", "Issue Key", json!({ "text": "TP-1" })),
            record("row_b", "Issue Key", json!("plain")),
            record("row_c", "Other", json!("TP-9")),
        ];
        let pairs = extract_identity_pairs(&records, "Issue Key");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs["TP-1"], "row_a");
    }

    #[test]
    fn test_mappings_for_binding_prepends_override() {
        let mappings: std::collections::BTreeMap<String, FieldMapping> = serde_yaml::from_str(
            r#"
            key:
              lark_field: ["Issue Key"]
              processor: extract_ticket_link
            "#,
        )
        .unwrap();

        let adjusted = mappings_for_binding(&mappings, Some("Ticket No"));
        let identity = adjusted
            .values()
            .find(|m| m.processor == Processor::ExtractTicketLink)
            .unwrap();
        match &identity.lark_field {
            SinkField::Candidates(names) => {
                assert_eq!(names[0], "Ticket No");
                assert_eq!(names[1], "Issue Key");
            }
            SinkField::Name(_) => panic!("expected candidate list"),
        }
    }

    #[test]
    fn test_mappings_for_binding_without_override_is_identity() {
        let mappings: std::collections::BTreeMap<String, FieldMapping> = serde_yaml::from_str(
            r#"
            key:
              lark_field: "Issue Key"
              processor: extract_ticket_link
            "#,
        )
        .unwrap();
        let adjusted = mappings_for_binding(&mappings, None);
        assert!(matches!(
            adjusted["key"].lark_field,
            SinkField::Name(ref name) if name == "Issue Key"
        ));
    }
}
