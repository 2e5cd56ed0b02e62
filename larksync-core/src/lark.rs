//! Lark Base (Bitable) client: token management, table scans, batch
//! creates, single-row updates and directory lookups.
//!
//! The Bitable API caps a create call at 500 rows and offers no batch
//! update, so `batch_create` does the chunking (with adaptive downsizing for
//! heavy rows) and `update` stays single-row. Retries for transient failures
//! live here, in the transport layer; callers see a success or a classified
//! failure.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::retry::retry_transient;
use crate::schema::TableField;

const BASE_URL: &str = "https://open.larksuite.com/open-apis";

/// Hard cap on rows per create request, documented by the API.
const MAX_CREATE_BATCH: usize = 500;

/// Page size for full table scans.
const SCAN_PAGE_SIZE: usize = 500;

/// Refresh the tenant token this long before it actually expires.
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(300);

/// Resolved workspace → app tokens are re-checked after this long, in case
/// a table was moved to a different Bitable app.
const APP_TOKEN_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Envelope error code for "too many requests".
const CODE_TOO_MANY_REQUESTS: i64 = 99991400;

/// Envelope error code for an unknown record id.
const CODE_RECORD_NOT_FOUND: i64 = 1254043;

#[derive(Debug, Clone)]
pub struct LarkSettings {
    pub app_id: String,
    pub app_secret: String,
}

/// One sink row: its id plus the raw field map.
#[derive(Debug, Clone, Deserialize)]
pub struct Record {
    pub record_id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// A directory user found by email.
#[derive(Debug, Clone)]
pub struct LarkUser {
    pub user_id: String,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
    expire: Option<u64>,
}

pub struct LarkClient {
    http: reqwest::Client,
    app_id: String,
    app_secret: String,
    token: RwLock<Option<(String, Instant)>>,
    app_tokens: RwLock<HashMap<String, (String, Instant)>>,
}

impl LarkClient {
    pub fn new(settings: &LarkSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("larksync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            app_id: settings.app_id.clone(),
            app_secret: settings.app_secret.clone(),
            token: RwLock::new(None),
            app_tokens: RwLock::new(HashMap::new()),
        })
    }

    async fn tenant_token(&self) -> Result<String, ApiError> {
        {
            let cached = self.token.read().await;
            if let Some((token, expires_at)) = cached.as_ref() {
                if Instant::now() < *expires_at {
                    return Ok(token.clone());
                }
            }
        }

        info!("requesting new tenant access token");
        let response = self
            .http
            .post(format!("{}/auth/v3/tenant_access_token/internal", BASE_URL))
            .json(&json!({ "app_id": self.app_id, "app_secret": self.app_secret }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = crate::error::retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), retry_after, body));
        }
        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|err| ApiError::Malformed(err.to_string()))?;
        if token_response.code != 0 {
            return Err(ApiError::Protocol {
                status: status.as_u16(),
                message: format!(
                    "token request failed (code {}): {}",
                    token_response.code, token_response.msg
                ),
            });
        }
        let token = token_response
            .tenant_access_token
            .ok_or_else(|| ApiError::Malformed("token response without token".into()))?;

        let lifetime = Duration::from_secs(token_response.expire.unwrap_or(7_200));
        let expires_at = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_BUFFER);
        *self.token.write().await = Some((token.clone(), expires_at));
        Ok(token)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        let token = self.tenant_token().await?;
        let mut request = self
            .http
            .request(method, format!("{}{}", BASE_URL, path))
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = crate::error::retry_after_secs(&response);
            let body_text = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), retry_after, body_text));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|err| ApiError::Malformed(err.to_string()))?;
        match envelope.code {
            0 => envelope
                .data
                .ok_or_else(|| ApiError::Malformed("response envelope without data".into())),
            CODE_TOO_MANY_REQUESTS => Err(ApiError::Throttled { retry_after: None }),
            code => Err(ApiError::Protocol {
                status: status.as_u16(),
                message: format!("lark code {}: {}", code, envelope.msg),
            }),
        }
    }

    /// Resolve a workspace (wiki) token to the Bitable app token, memoized
    /// with a TTL.
    pub async fn resolve_app_token(&self, wiki_token: &str) -> Result<String, ApiError> {
        {
            let cache = self.app_tokens.read().await;
            if let Some((app_token, resolved_at)) = cache.get(wiki_token) {
                if resolved_at.elapsed() < APP_TOKEN_TTL {
                    return Ok(app_token.clone());
                }
            }
        }

        #[derive(Deserialize)]
        struct NodeData {
            node: Node,
        }
        #[derive(Deserialize)]
        struct Node {
            obj_token: String,
        }

        let query = [("token", wiki_token.to_string())];
        let data: NodeData = retry_transient("lark wiki node lookup", || {
            self.call(
                reqwest::Method::GET,
                "/wiki/v2/spaces/get_node",
                &query,
                None,
            )
        })
        .await?;

        let mut cache = self.app_tokens.write().await;
        cache.insert(
            wiki_token.to_string(),
            (data.node.obj_token.clone(), Instant::now()),
        );
        Ok(data.node.obj_token)
    }

    /// List the live columns of a table.
    pub async fn list_fields(
        &self,
        app_token: &str,
        table_id: &str,
    ) -> Result<Vec<TableField>, ApiError> {
        #[derive(Deserialize)]
        struct FieldPage {
            #[serde(default)]
            items: Vec<TableField>,
            page_token: Option<String>,
            #[serde(default)]
            has_more: bool,
        }

        let path = format!("/bitable/v1/apps/{}/tables/{}/fields", app_token, table_id);
        let mut fields = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("page_size", "100".to_string())];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }
            let page: FieldPage = retry_transient("lark list fields", || {
                self.call(reqwest::Method::GET, &path, &query, None)
            })
            .await?;
            fields.extend(page.items);
            match page.page_token {
                Some(token) if page.has_more => page_token = Some(token),
                _ => break,
            }
        }
        debug!("table {} has {} fields", table_id, fields.len());
        Ok(fields)
    }

    /// Full table scan. Yields every row exactly once per call.
    pub async fn scan(
        &self,
        app_token: &str,
        table_id: &str,
    ) -> Result<Vec<Record>, ApiError> {
        #[derive(Deserialize)]
        struct RecordPage {
            #[serde(default)]
            items: Vec<Record>,
            page_token: Option<String>,
            #[serde(default)]
            has_more: bool,
        }

        let path = format!("/bitable/v1/apps/{}/tables/{}/records", app_token, table_id);
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("page_size", SCAN_PAGE_SIZE.to_string())];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }
            let page: RecordPage = retry_transient("lark table scan", || {
                self.call(reqwest::Method::GET, &path, &query, None)
            })
            .await?;
            records.extend(page.items);
            match page.page_token {
                Some(token) if page.has_more => page_token = Some(token),
                _ => break,
            }
        }
        info!("table scan complete: {} records from {}", records.len(), table_id);
        Ok(records)
    }

    /// Create a batch of rows, returning one result per input row, aligned
    /// by index.
    ///
    /// Rows are chunked to respect the 500-row cap, with the chunk size
    /// reduced further when sampled rows look heavy. A chunk that fails
    /// outright falls back to per-row creates so a single bad row cannot
    /// take its neighbours down with it.
    pub async fn batch_create(
        &self,
        app_token: &str,
        table_id: &str,
        rows: &[Map<String, Value>],
    ) -> Vec<Result<String, String>> {
        let mut results = Vec::with_capacity(rows.len());
        if rows.is_empty() {
            return results;
        }

        let chunk_size = adaptive_batch_size(rows);
        info!(
            "creating {} rows in chunks of {} in table {}",
            rows.len(),
            chunk_size,
            table_id
        );

        for chunk in rows.chunks(chunk_size) {
            match self.create_chunk(app_token, table_id, chunk).await {
                Ok(ids) => {
                    // Returned ids must align one-to-one with the chunk.
                    if ids.len() == chunk.len() {
                        results.extend(ids.into_iter().map(Ok));
                    } else {
                        warn!(
                            "batch create returned {} ids for {} rows; retrying rows individually",
                            ids.len(),
                            chunk.len()
                        );
                        results.extend(self.create_rows_individually(app_token, table_id, chunk).await);
                    }
                }
                Err(err) => {
                    warn!(
                        "batch create chunk of {} failed ({}); retrying rows individually",
                        chunk.len(),
                        err
                    );
                    results.extend(self.create_rows_individually(app_token, table_id, chunk).await);
                }
            }
        }
        results
    }

    async fn create_chunk(
        &self,
        app_token: &str,
        table_id: &str,
        chunk: &[Map<String, Value>],
    ) -> Result<Vec<String>, ApiError> {
        #[derive(Deserialize)]
        struct CreatedRecords {
            #[serde(default)]
            records: Vec<Record>,
        }

        let path = format!(
            "/bitable/v1/apps/{}/tables/{}/records/batch_create",
            app_token, table_id
        );
        let body = json!({
            "records": chunk.iter().map(|fields| json!({ "fields": fields })).collect::<Vec<_>>()
        });

        let data: CreatedRecords = retry_transient("lark batch create", || {
            self.call(reqwest::Method::POST, &path, &[], Some(&body))
        })
        .await?;
        Ok(data.records.into_iter().map(|r| r.record_id).collect())
    }

    async fn create_rows_individually(
        &self,
        app_token: &str,
        table_id: &str,
        rows: &[Map<String, Value>],
    ) -> Vec<Result<String, String>> {
        let mut results = Vec::with_capacity(rows.len());
        for fields in rows {
            let result = self
                .create_record(app_token, table_id, fields)
                .await
                .map_err(|err| err.to_string());
            results.push(result);
        }
        results
    }

    /// Create a single row.
    pub async fn create_record(
        &self,
        app_token: &str,
        table_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<String, ApiError> {
        #[derive(Deserialize)]
        struct CreatedRecord {
            record: Record,
        }

        let path = format!("/bitable/v1/apps/{}/tables/{}/records", app_token, table_id);
        let body = json!({ "fields": fields });
        let data: CreatedRecord = retry_transient("lark create record", || {
            self.call(reqwest::Method::POST, &path, &[], Some(&body))
        })
        .await?;
        Ok(data.record.record_id)
    }

    /// Update a single row. There is no batch update in the API.
    ///
    /// A vanished `record_id` surfaces as [`ApiError::RecordNotFound`] so
    /// the pipeline can drop its stale mapping instead of retrying forever.
    pub async fn update_record(
        &self,
        app_token: &str,
        table_id: &str,
        record_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), ApiError> {
        #[derive(Deserialize)]
        struct UpdatedRecord {
            #[serde(rename = "record")]
            _record: Record,
        }

        let path = format!(
            "/bitable/v1/apps/{}/tables/{}/records/{}",
            app_token, table_id, record_id
        );
        let body = json!({ "fields": fields });
        let result: Result<UpdatedRecord, ApiError> = retry_transient("lark update record", || {
            self.call(reqwest::Method::PUT, &path, &[], Some(&body))
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(ApiError::Protocol { status: 404, .. }) => {
                Err(ApiError::RecordNotFound(record_id.to_string()))
            }
            Err(ApiError::Protocol { message, .. })
                if message.contains(&CODE_RECORD_NOT_FOUND.to_string()) =>
            {
                Err(ApiError::RecordNotFound(record_id.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Look up a directory user by email. `Ok(None)` when the directory has
    /// no match.
    pub async fn lookup_user(&self, email: &str) -> Result<Option<LarkUser>, ApiError> {
        #[derive(Deserialize)]
        struct UserList {
            #[serde(default)]
            user_list: Vec<UserEntry>,
        }
        #[derive(Deserialize)]
        struct UserEntry {
            user_id: Option<String>,
            name: Option<String>,
        }

        let body = json!({ "emails": [email] });
        let query = [("user_id_type", "open_id".to_string())];
        let data: UserList = retry_transient("lark user lookup", || {
            self.call(
                reqwest::Method::POST,
                "/contact/v3/users/batch_get_id",
                &query,
                Some(&body),
            )
        })
        .await?;

        Ok(data
            .user_list
            .into_iter()
            .find_map(|entry| {
                entry.user_id.map(|user_id| LarkUser {
                    user_id,
                    name: entry.name,
                })
            }))
    }
}

/// Chunk size for a create call. Heavy rows go in smaller chunks: large
/// payloads are where the API starts rejecting and timing out.
fn adaptive_batch_size(rows: &[Map<String, Value>]) -> usize {
    let sample_size = rows.len().min(10);
    if sample_size == 0 {
        return MAX_CREATE_BATCH;
    }

    let mut total_fields = 0usize;
    let mut total_len = 0usize;
    for row in &rows[..sample_size] {
        total_fields += row.len();
        total_len += serde_json::to_string(row).map_or(0, |s| s.len());
    }
    let avg_fields = total_fields / sample_size;
    let avg_len = total_len / sample_size;

    if avg_fields >= 20 || avg_len >= 2_000 {
        200
    } else if avg_fields >= 10 || avg_len >= 1_000 {
        350
    } else {
        MAX_CREATE_BATCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: usize, value_len: usize) -> Map<String, Value> {
        let mut map = Map::new();
        for i in 0..fields {
            map.insert(format!("field_{}", i), Value::String("x".repeat(value_len)));
        }
        map
    }

    #[test]
    fn test_adaptive_batch_size_simple_rows_use_max() {
        let rows = vec![row(5, 10); 1000];
        assert_eq!(adaptive_batch_size(&rows), 500);
    }

    #[test]
    fn test_adaptive_batch_size_mid_rows_cap_350() {
        let rows = vec![row(12, 10); 1000];
        assert_eq!(adaptive_batch_size(&rows), 350);
    }

    #[test]
    fn test_adaptive_batch_size_heavy_rows_cap_200() {
        let rows = vec![row(25, 10); 1000];
        assert_eq!(adaptive_batch_size(&rows), 200);

        let long_rows = vec![row(3, 1_500); 10];
        assert_eq!(adaptive_batch_size(&long_rows), 200);
    }

    #[test]
    fn test_adaptive_batch_size_empty() {
        assert_eq!(adaptive_batch_size(&[]), 500);
    }

    #[test]
    fn test_envelope_deserializes() {
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(
            r#"{ "code": 0, "msg": "success", "data": { "items": [] } }"#,
        )
        .unwrap();
        assert_eq!(envelope.code, 0);
        assert!(envelope.data.is_some());

        let error: Envelope<serde_json::Value> =
            serde_json::from_str(r#"{ "code": 1254043, "msg": "RecordIdNotFound" }"#).unwrap();
        assert_eq!(error.code, 1254043);
        assert!(error.data.is_none());
    }

    #[test]
    fn test_record_deserializes_without_fields() {
        let record: Record = serde_json::from_str(r#"{ "record_id": "rec_1" }"#).unwrap();
        assert_eq!(record.record_id, "rec_1");
        assert!(record.fields.is_empty());
    }
}
