//! Schema-driven projection of raw source issues into sink field maps.
//!
//! Projection is pure given the schema plan and the user cache contents: it
//! reads the raw field map, applies one processor per plan entry, and emits
//! only columns that exist on the live table. A failing field degrades to
//! null; a failing identity field fails the whole issue, because a row
//! without its key cannot be placed in the sink.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::jira::Issue;
use crate::schema::{LinkRule, PlanEntry, Processor, ProjectionPlan};
use crate::users::UserMapper;

/// Parse a source timestamp into epoch milliseconds.
///
/// Accepts both the JIRA server form (`2025-01-08T03:45:23.000+0000`) and
/// plain RFC 3339 (`2024-07-09T15:30:00+08:00`).
pub fn parse_source_timestamp(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|dt| dt.timestamp_millis())
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("issue {0} produced no usable identity value")]
    MissingIdentity(String),
}

pub struct FieldProcessor {
    server_url: String,
    link_rules: BTreeMap<String, LinkRule>,
    mapper: Option<UserMapper>,
}

impl FieldProcessor {
    pub fn new(
        server_url: &str,
        link_rules: BTreeMap<String, LinkRule>,
        mapper: Option<UserMapper>,
    ) -> Self {
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            link_rules,
            mapper,
        }
    }

    /// Project one issue through the plan into a sink field map.
    pub fn project(
        &self,
        issue: &Issue,
        plan: &ProjectionPlan,
    ) -> Result<Map<String, Value>, ProjectionError> {
        let mut out = Map::new();

        for entry in &plan.entries {
            let raw = self.raw_value(issue, &entry.source_path);
            let value = self.apply(entry, raw, &issue.key);

            if entry.processor == Processor::ExtractTicketLink && value.is_null() {
                return Err(ProjectionError::MissingIdentity(issue.key.clone()));
            }
            out.insert(entry.column.clone(), value);
        }

        Ok(out)
    }

    /// Fetch the raw value for a source path. `key` lives on the issue
    /// itself; everything else is under `fields`, with dotted paths walked
    /// segment by segment.
    fn raw_value(&self, issue: &Issue, source_path: &str) -> Value {
        if source_path == "key" {
            return Value::String(issue.key.clone());
        }

        let mut current: &Value = match source_path.split('.').next() {
            Some(first) => match issue.fields.get(first) {
                Some(value) => value,
                None => return Value::Null,
            },
            None => return Value::Null,
        };
        for segment in source_path.split('.').skip(1) {
            match current.get(segment) {
                Some(value) => current = value,
                None => return Value::Null,
            }
        }
        current.clone()
    }

    fn apply(&self, entry: &PlanEntry, raw: Value, issue_key: &str) -> Value {
        if raw.is_null() {
            return match entry.processor {
                // A wrapped object can be absent while its column still
                // expects the empty string.
                Processor::ExtractNested => {
                    extract_nested(Value::Null, entry.nested_path.as_deref())
                }
                // Person and multi-select columns accept only arrays.
                Processor::ExtractUser
                | Processor::ExtractComponents
                | Processor::ExtractVersions => Value::Array(Vec::new()),
                _ => Value::Null,
            };
        }

        match entry.processor {
            Processor::ExtractSimple => extract_simple(raw),
            Processor::ExtractNested => extract_nested(raw, entry.nested_path.as_deref()),
            Processor::ExtractUser => match &self.mapper {
                Some(mapper) => Value::Array(mapper.map_user(&raw)),
                None => Value::Array(Vec::new()),
            },
            Processor::ConvertDatetime => match raw.as_str().and_then(parse_source_timestamp) {
                Some(ms) => Value::from(ms),
                None => {
                    warn!(
                        "issue {}: unparseable timestamp in {}: {:?}",
                        issue_key, entry.source_path, raw
                    );
                    Value::Null
                }
            },
            Processor::ExtractComponents | Processor::ExtractVersions => {
                Value::Array(named_list(&raw))
            }
            Processor::ExtractLinks => self.format_links(&raw, None),
            Processor::ExtractLinksFiltered => {
                let allowed = self.allowed_link_prefixes(issue_key);
                self.format_links(&raw, allowed)
            }
            Processor::ExtractTicketLink => self.ticket_hyperlink(&raw),
        }
    }

    /// The allowlist for the current issue's project prefix, if filtering is
    /// configured and enabled. `None` means pass-through.
    fn allowed_link_prefixes(&self, issue_key: &str) -> Option<&[String]> {
        let prefix = issue_key_prefix(issue_key)?;
        let rule = self
            .link_rules
            .get(&prefix)
            .or_else(|| self.link_rules.get("default"))?;
        if !rule.enabled || rule.display_link_prefixes.is_empty() {
            return None;
        }
        Some(&rule.display_link_prefixes)
    }

    /// Render an `issuelinks` array as `link_type: browse_url` lines, one
    /// per inward/outward linked issue, optionally restricted to allowed
    /// key prefixes.
    fn format_links(&self, raw: &Value, allowed: Option<&[String]>) -> Value {
        let Some(links) = raw.as_array() else {
            return Value::Null;
        };

        let mut lines = Vec::new();
        for link in links {
            for (side, type_key) in [("outwardIssue", "outward"), ("inwardIssue", "inward")] {
                let Some(key) = link
                    .get(side)
                    .and_then(|issue| issue.get("key"))
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                if let Some(allowed) = allowed {
                    match issue_key_prefix(key) {
                        Some(prefix) if allowed.contains(&prefix) => {}
                        _ => continue,
                    }
                }
                let link_type = link
                    .get("type")
                    .and_then(|t| t.get(type_key))
                    .and_then(Value::as_str)
                    .unwrap_or("relates to");
                lines.push(format!("{}: {}/browse/{}", link_type, self.server_url, key));
            }
        }

        if lines.is_empty() {
            Value::Null
        } else {
            Value::String(lines.join("\n"))
        }
    }

    /// Produce the sink's hyperlink object for the identity column.
    fn ticket_hyperlink(&self, raw: &Value) -> Value {
        let key = match raw {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(obj) => obj
                .get("key")
                .or_else(|| obj.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Value::Array(items) => items.first().and_then(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(obj) => obj
                    .get("key")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            }),
            _ => None,
        };

        match key {
            Some(key) if !key.is_empty() => {
                let url = format!("{}/browse/{}", self.server_url, key);
                json!({ "link": url, "text": key })
            }
            _ => Value::Null,
        }
    }
}

fn extract_simple(value: Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value,
        // Structured values degrade to their JSON text so they still land in
        // a text column instead of being dropped.
        other => match serde_json::to_string(&other) {
            Ok(text) => Value::String(text),
            Err(_) => Value::Null,
        },
    }
}

/// Dereference one level of a wrapped object. A missing intermediate yields
/// the empty string, which is distinct from a present-but-null value and
/// matches what the sink shows for "no value" text cells.
fn extract_nested(value: Value, nested_path: Option<&str>) -> Value {
    let Some(path) = nested_path else {
        return extract_simple(value);
    };
    match value {
        Value::Object(obj) => match obj.get(path) {
            Some(Value::Null) | None => Value::String(String::new()),
            Some(inner) => inner.clone(),
        },
        _ => Value::String(String::new()),
    }
}

/// Names out of an array of `{name: …}` objects (components, versions),
/// preserving order.
fn named_list(value: &Value) -> Vec<Value> {
    let Some(items) = value.as_array() else {
        debug!("expected an array of named objects, got {:?}", value);
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(obj) => obj.get("name").and_then(Value::as_str).map(Value::from),
            Value::String(s) => Some(Value::from(s.as_str())),
            _ => None,
        })
        .collect()
}

/// `TCG-108387` → `TCG`. None when the key has no alphabetic prefix.
fn issue_key_prefix(issue_key: &str) -> Option<String> {
    let (prefix, _) = issue_key.trim().split_once('-')?;
    let prefix = prefix.to_ascii_uppercase();
    (!prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_alphabetic()))
        .then_some(prefix)
}
