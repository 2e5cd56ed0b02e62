//! JIRA REST client focused on data retrieval.
//!
//! `search` is atomic in outcome: it first asks the server for the total hit
//! count, then pages through the result set, and either returns the complete
//! deduplicated set or fails. A truncated set must never reach the pipeline,
//! because recording a completed cycle against partial input would
//! permanently skip the missing issues.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::fields::parse_source_timestamp;
use crate::retry::retry_transient;

/// Keys per `key IN (…)` sub-query when fetching by explicit key list.
/// Keeps request URIs comfortably below server limits.
const KEYS_PER_QUERY: usize = 100;

/// JIRA caps a search page at 1000 results.
const MAX_PAGE_SIZE: usize = 1000;

/// Connection settings for [`JiraClient::new`].
#[derive(Debug, Clone)]
pub struct JiraSettings {
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
    /// Extra root certificate for on-premise servers, already resolved to an
    /// absolute path.
    pub ca_cert_path: Option<std::path::PathBuf>,
}

/// A raw source issue: its key plus the opaque field map the schema
/// interprets.
#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub key: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Issue {
    /// The issue's `updated` timestamp as epoch milliseconds, if present and
    /// parseable.
    pub fn updated_ms(&self) -> Option<i64> {
        self.fields
            .get("updated")
            .and_then(Value::as_str)
            .and_then(parse_source_timestamp)
    }
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    total: usize,
    #[serde(default)]
    issues: Vec<Issue>,
}

pub struct JiraClient {
    http: reqwest::Client,
    server_url: String,
    username: String,
    password: String,
}

impl JiraClient {
    pub fn new(settings: &JiraSettings) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("larksync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.timeout_secs));

        if let Some(path) = &settings.ca_cert_path {
            let pem = std::fs::read(path).map_err(|err| {
                anyhow::anyhow!("Failed to read CA certificate {:?}: {}", path, err)
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            http: builder.build()?,
            server_url: settings.server_url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    async fn get_raw(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.server_url, endpoint);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .query(params)
            .send()
            .await?;
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let response = self.get_raw(endpoint, params).await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = crate::error::retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), retry_after, body));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ApiError::Malformed(err.to_string()))
    }

    async fn count_once(&self, jql: &str) -> Result<usize, ApiError> {
        let page: SearchPage = self
            .get_json(
                "/rest/api/2/search",
                &[
                    ("jql", jql.to_string()),
                    ("maxResults", "0".to_string()),
                ],
            )
            .await?;
        Ok(page.total)
    }

    async fn fetch_page(
        &self,
        jql: &str,
        fields: &str,
        start_at: usize,
        max_results: usize,
    ) -> Result<SearchPage, ApiError> {
        self.get_json(
            "/rest/api/2/search",
            &[
                ("jql", jql.to_string()),
                ("fields", fields.to_string()),
                ("startAt", start_at.to_string()),
                ("maxResults", max_results.to_string()),
            ],
        )
        .await
    }

    /// Run a JQL search and return every matching issue, keyed and
    /// deduplicated.
    ///
    /// Duplicates can appear when the server paginates while issues mutate;
    /// the entry with the greatest `updated` wins. Any page failing after
    /// retries fails the whole call — no partial set is returned.
    pub async fn search(
        &self,
        jql: &str,
        fields: &[String],
    ) -> Result<HashMap<String, Issue>, ApiError> {
        let field_list = field_list_with_key(fields);
        info!("jira search: {}", jql);

        let total =
            retry_transient("jira search count", || self.count_once(jql)).await?;
        if total == 0 {
            debug!("jira search matched nothing");
            return Ok(HashMap::new());
        }

        let batch_size = optimal_batch_size(total, None);
        debug!(
            "fetching {} issues in pages of {}",
            total, batch_size
        );

        let mut issues: HashMap<String, Issue> = HashMap::new();
        let mut fetched = 0usize;
        let mut start_at = 0usize;
        while start_at < total {
            let page = retry_transient("jira search page", || {
                self.fetch_page(jql, &field_list, start_at, batch_size)
            })
            .await?;
            fetched += page.issues.len();
            for issue in page.issues {
                insert_newer(&mut issues, issue);
            }
            start_at += batch_size;
        }

        // Fewer rows than the count is normal (dedup, mid-flight deletions);
        // more unique keys than the count means the pages overlapped in a way
        // dedup cannot vouch for.
        if issues.len() > total {
            return Err(ApiError::Incomplete {
                expected: total,
                fetched: issues.len(),
            });
        }
        if fetched < total {
            debug!(
                "jira search returned {} rows for a count of {} (duplicates or deletions)",
                fetched, total
            );
        }

        info!("jira search complete: {} unique issues", issues.len());
        Ok(issues)
    }

    /// Fetch an explicit key set, partitioned into `key IN (…)` sub-queries
    /// small enough to keep the request URI bounded.
    pub async fn search_keys(
        &self,
        keys: &[String],
        fields: &[String],
    ) -> Result<HashMap<String, Issue>, ApiError> {
        let mut issues = HashMap::new();
        for chunk in keys.chunks(KEYS_PER_QUERY) {
            let jql = keys_jql(chunk);
            let chunk_issues = self.search(&jql, fields).await?;
            for (_, issue) in chunk_issues {
                insert_newer(&mut issues, issue);
            }
        }

        let missing: Vec<&String> = keys.iter().filter(|k| !issues.contains_key(*k)).collect();
        if !missing.is_empty() {
            warn!(
                "{} of {} requested issue keys were not found (first few: {:?})",
                missing.len(),
                keys.len(),
                &missing[..missing.len().min(5)]
            );
        }
        Ok(issues)
    }

    /// Fetch a single issue. `Ok(None)` when the key does not exist.
    pub async fn get(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Option<Issue>, ApiError> {
        let field_list = field_list_with_key(fields);
        let response = retry_transient("jira get issue", || async {
            let response = self
                .get_raw(
                    &format!("/rest/api/2/issue/{}", key),
                    &[("fields", field_list.clone())],
                )
                .await?;
            let status = response.status();
            if status.as_u16() == 404 {
                return Ok(None);
            }
            if !status.is_success() {
                let retry_after = crate::error::retry_after_secs(&response);
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::from_status(status.as_u16(), retry_after, body));
            }
            let issue = response
                .json::<Issue>()
                .await
                .map_err(|err| ApiError::Malformed(err.to_string()))?;
            Ok(Some(issue))
        })
        .await?;
        Ok(response)
    }

    /// Cheap syntax check for a configured filter expression.
    pub async fn validate_jql(&self, jql: &str) -> bool {
        let result: Result<SearchPage, _> = self
            .get_json(
                "/rest/api/2/search",
                &[
                    ("jql", jql.to_string()),
                    ("maxResults", "1".to_string()),
                ],
            )
            .await;
        match result {
            Ok(_) => true,
            Err(err) => {
                warn!("jql validation failed: {}", err);
                false
            }
        }
    }
}

fn field_list_with_key(fields: &[String]) -> String {
    let mut fields: Vec<&str> = fields.iter().map(String::as_str).collect();
    if !fields.contains(&"key") {
        fields.push("key");
    }
    fields.join(",")
}

/// Keep the entry with the greatest `updated` when the same key appears
/// twice.
fn insert_newer(issues: &mut HashMap<String, Issue>, issue: Issue) {
    match issues.get(&issue.key) {
        Some(existing) if existing.updated_ms() >= issue.updated_ms() => {}
        _ => {
            issues.insert(issue.key.clone(), issue);
        }
    }
}

/// Page size tuned to finish typical result sets in a handful of calls.
fn optimal_batch_size(total: usize, cap: Option<usize>) -> usize {
    if let Some(cap) = cap {
        return cap.min(MAX_PAGE_SIZE).max(1);
    }
    if total <= 500 {
        total.max(1)
    } else if total <= 5_000 {
        500
    } else {
        MAX_PAGE_SIZE
    }
}

fn keys_jql(keys: &[String]) -> String {
    let quoted: Vec<String> = keys.iter().map(|k| format!("\"{}\"", k)).collect();
    format!("key IN ({})", quoted.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issue(key: &str, updated: &str) -> Issue {
        let mut fields = Map::new();
        fields.insert("updated".to_string(), json!(updated));
        Issue {
            key: key.to_string(),
            fields,
        }
    }

    #[test]
    fn test_updated_ms_parses_jira_offset_format() {
        let issue = issue("TP-1", "2025-01-08T03:45:23.000+0000");
        assert_eq!(issue.updated_ms(), Some(1736307923000));
    }

    #[test]
    fn test_updated_ms_parses_rfc3339_offset() {
        let issue = issue("TP-1", "2024-07-09T15:30:00+08:00");
        assert_eq!(issue.updated_ms(), Some(1720510200000));
    }

    #[test]
    fn test_insert_newer_keeps_max_updated() {
        let mut issues = HashMap::new();
        insert_newer(&mut issues, issue("TP-1", "2024-07-09T15:30:00+08:00"));
        insert_newer(&mut issues, issue("TP-1", "2024-07-09T10:00:00+08:00"));
        assert_eq!(
            issues["TP-1"].updated_ms(),
            Some(1720510200000),
            "older duplicate must not replace newer entry"
        );

        insert_newer(&mut issues, issue("TP-1", "2024-07-10T09:00:00+08:00"));
        assert_eq!(
            issues["TP-1"].fields["updated"],
            json!("2024-07-10T09:00:00+08:00")
        );
    }

    #[test]
    fn test_optimal_batch_size() {
        assert_eq!(optimal_batch_size(1, None), 1);
        assert_eq!(optimal_batch_size(400, None), 400);
        assert_eq!(optimal_batch_size(2_000, None), 500);
        assert_eq!(optimal_batch_size(50_000, None), 1000);
        assert_eq!(optimal_batch_size(50_000, Some(200)), 200);
        assert_eq!(optimal_batch_size(0, None), 1);
    }

    #[test]
    fn test_keys_jql_quotes_keys() {
        let jql = keys_jql(&["TP-1".to_string(), "ICR-7".to_string()]);
        assert_eq!(jql, "key IN (\"TP-1\", \"ICR-7\")");
    }

    #[test]
    fn test_field_list_always_includes_key() {
        assert_eq!(
            field_list_with_key(&["summary".to_string()]),
            "summary,key"
        );
        assert_eq!(
            field_list_with_key(&["key".to_string(), "updated".to_string()]),
            "key,updated"
        );
    }
}
