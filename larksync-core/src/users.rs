//! Persistent user mapping: JIRA usernames to Lark directory users.
//!
//! The cache is a single global SQLite store with a three-state lifecycle
//! per username:
//!
//! - **valid**: the directory lookup succeeded; the Lark user reference is
//!   populated and person fields can be written.
//! - **empty**: the directory lookup ran and found nothing; we stop asking.
//! - **pending**: seen during projection but never looked up. The online
//!   path never calls the directory; it records the name as pending and
//!   moves on, so a cycle's latency is independent of how many new users it
//!   encounters. The offline resolver drains pending entries later.
//!
//! valid/empty entries are never downgraded to pending by the sync itself;
//! only an explicit reopen does that.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::lark::LarkClient;

/// Schema version for the cache database, tracked via `user_version`.
const SCHEMA_VERSION: i32 = 1;

/// A resolved Lark directory user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LarkUserRef {
    pub email: String,
    pub user_id: String,
    pub name: Option<String>,
}

/// The three cache states. Exactly one holds per username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserState {
    Valid(LarkUserRef),
    Empty,
    Pending,
}

pub struct UserCache {
    conn: Mutex<Connection>,
}

impl UserCache {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open user cache at {:?}", path))?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    /// In-memory cache (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory user cache")?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "User cache schema version {} is newer than supported version {}",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS user_mappings (
                    username TEXT PRIMARY KEY,
                    lark_email TEXT,
                    lark_user_id TEXT,
                    lark_name TEXT,
                    is_empty INTEGER NOT NULL DEFAULT 0,
                    is_pending INTEGER NOT NULL DEFAULT 0,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_user_mappings_status
                ON user_mappings (is_empty, is_pending);
                "#,
            )
            .context("Failed to create user cache schema")?;
        }

        if current_version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(())
    }

    pub fn get(&self, username: &str) -> Result<Option<UserState>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let row = conn
            .query_row(
                "SELECT lark_email, lark_user_id, lark_name, is_empty, is_pending \
                 FROM user_mappings WHERE username = ?1",
                [username],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query user mapping")?;

        Ok(row.map(|(email, user_id, name, is_empty, is_pending)| {
            row_to_state(email, user_id, name, is_empty, is_pending)
        }))
    }

    /// Single round-trip lookup for a set of usernames.
    pub fn batch_get(&self, usernames: &[String]) -> Result<HashMap<String, UserState>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT username, lark_email, lark_user_id, lark_name, is_empty, is_pending \
                 FROM user_mappings",
            )
            .context("Failed to prepare batch_get")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })
            .context("Failed to query user mappings")?;

        let mut result = HashMap::new();
        for row in rows {
            let (username, email, user_id, name, is_empty, is_pending) =
                row.context("Failed to read row")?;
            if usernames.contains(&username) {
                result.insert(
                    username,
                    row_to_state(email, user_id, name, is_empty, is_pending),
                );
            }
        }
        Ok(result)
    }

    pub fn put_valid(&self, username: &str, user: &LarkUserRef) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO user_mappings \
             (username, lark_email, lark_user_id, lark_name, is_empty, is_pending, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 0, 0, ?5) \
             ON CONFLICT (username) DO UPDATE SET \
                lark_email = excluded.lark_email, \
                lark_user_id = excluded.lark_user_id, \
                lark_name = excluded.lark_name, \
                is_empty = 0, is_pending = 0, \
                updated_at = excluded.updated_at",
            rusqlite::params![
                username,
                &user.email,
                &user.user_id,
                &user.name,
                now_ms()
            ],
        )
        .context("Failed to store valid user mapping")?;
        Ok(())
    }

    pub fn put_empty(&self, username: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO user_mappings \
             (username, lark_email, lark_user_id, lark_name, is_empty, is_pending, updated_at) \
             VALUES (?1, NULL, NULL, NULL, 1, 0, ?2) \
             ON CONFLICT (username) DO UPDATE SET \
                lark_email = NULL, lark_user_id = NULL, lark_name = NULL, \
                is_empty = 1, is_pending = 0, \
                updated_at = excluded.updated_at",
            rusqlite::params![username, now_ms()],
        )
        .context("Failed to store empty user mapping")?;
        Ok(())
    }

    /// Record a username as pending. A no-op if any entry already exists, so
    /// valid/empty entries are never downgraded by the sync path.
    pub fn mark_pending(&self, username: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let inserted = conn
            .execute(
                "INSERT INTO user_mappings \
                 (username, is_empty, is_pending, updated_at) \
                 VALUES (?1, 0, 1, ?2) \
                 ON CONFLICT (username) DO NOTHING",
                rusqlite::params![username, now_ms()],
            )
            .context("Failed to mark user pending")?;
        Ok(inserted > 0)
    }

    /// Explicitly reopen an entry for re-resolution (operator action).
    pub fn reopen(&self, username: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO user_mappings \
             (username, is_empty, is_pending, updated_at) \
             VALUES (?1, 0, 1, ?2) \
             ON CONFLICT (username) DO UPDATE SET \
                is_empty = 0, is_pending = 1, updated_at = excluded.updated_at",
            rusqlite::params![username, now_ms()],
        )
        .context("Failed to reopen user mapping")?;
        Ok(())
    }

    /// Usernames still awaiting resolution: pending, or not-empty entries
    /// missing a user id (left behind by older cache formats).
    pub fn incomplete(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT username FROM user_mappings \
                 WHERE is_pending = 1 \
                    OR (is_empty = 0 AND (lark_user_id IS NULL OR lark_user_id = '')) \
                 ORDER BY username",
            )
            .context("Failed to prepare incomplete query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query incomplete users")?;

        let mut usernames = Vec::new();
        for row in rows {
            usernames.push(row.context("Failed to read row")?);
        }
        Ok(usernames)
    }

    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM user_mappings WHERE is_pending = 1",
                [],
                |row| row.get(0),
            )
            .context("Failed to count pending users")?;
        Ok(count as usize)
    }
}

fn row_to_state(
    email: Option<String>,
    user_id: Option<String>,
    name: Option<String>,
    is_empty: bool,
    is_pending: bool,
) -> UserState {
    if is_pending {
        UserState::Pending
    } else if is_empty {
        UserState::Empty
    } else {
        match (email, user_id) {
            (Some(email), Some(user_id)) if !user_id.is_empty() => UserState::Valid(LarkUserRef {
                email,
                user_id,
                name,
            }),
            // Not flagged, but the reference is unusable. Treat as pending so
            // the resolver picks it up.
            _ => UserState::Pending,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Outcome of resolving the pending set against the directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResolveStats {
    pub attempted: usize,
    pub resolved: usize,
    pub empty: usize,
    pub skipped: usize,
}

/// Non-blocking mapping from JIRA user objects to Lark person-field values.
#[derive(Clone)]
pub struct UserMapper {
    cache: Arc<UserCache>,
    email_domains: Vec<String>,
}

impl UserMapper {
    pub fn new(cache: Arc<UserCache>, email_domains: Vec<String>) -> Self {
        Self {
            cache,
            email_domains,
        }
    }

    /// Extract the bare username from a JIRA identifier: the local part of
    /// an email address, or the identifier itself.
    pub fn extract_username(identifier: &str) -> Option<String> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }
        let username = match identifier.split_once('@') {
            Some((local, _)) => local,
            None => identifier,
        };
        (!username.is_empty()).then(|| username.to_string())
    }

    /// Map a raw JIRA user object into the sink's person-field value.
    ///
    /// Returns the person list (`[{"id": …}]`) for a valid mapping and the
    /// empty list otherwise: Bitable person columns accept only arrays, so
    /// pending and empty users both project to "no person". Unknown names
    /// are persisted as pending without any directory call.
    pub fn map_user(&self, jira_user: &Value) -> Vec<Value> {
        let Some(user) = jira_user.as_object() else {
            return Vec::new();
        };

        let identifier = user
            .get("emailAddress")
            .and_then(Value::as_str)
            .or_else(|| user.get("name").and_then(Value::as_str));
        let Some(identifier) = identifier else {
            let display_name = user
                .get("displayName")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            warn!("source user {} has neither emailAddress nor name", display_name);
            return Vec::new();
        };
        let Some(username) = Self::extract_username(identifier) else {
            return Vec::new();
        };

        match self.cache.get(&username) {
            Ok(Some(UserState::Valid(user))) => {
                debug!("user mapping hit: {} -> {}", username, user.user_id);
                vec![json!({ "id": user.user_id })]
            }
            Ok(Some(UserState::Empty)) => {
                debug!("user mapping hit (empty): {}", username);
                Vec::new()
            }
            Ok(Some(UserState::Pending)) => {
                debug!("user mapping still pending: {}", username);
                Vec::new()
            }
            Ok(None) => {
                if let Err(err) = self.cache.mark_pending(&username) {
                    warn!("failed to mark user {} pending: {}", username, err);
                } else {
                    info!("user {} queued for offline resolution", username);
                }
                Vec::new()
            }
            Err(err) => {
                warn!("user cache read failed for {}: {}", username, err);
                Vec::new()
            }
        }
    }

    /// Candidate email addresses for a username, one per configured domain.
    /// Entries containing `@` are literal suffixes appended to the username;
    /// plain entries are domains.
    fn candidate_emails(&self, username: &str) -> Vec<String> {
        self.email_domains
            .iter()
            .map(|domain| {
                if domain.contains('@') {
                    format!("{}{}", username, domain)
                } else {
                    format!("{}@{}", username, domain)
                }
            })
            .collect()
    }

    /// Offline path: drain the incomplete set against the directory.
    ///
    /// Each username is tried against every configured domain; the first hit
    /// writes a valid entry, exhausting all domains writes an empty entry. A
    /// lookup that fails (as opposed to finding nothing) leaves the entry
    /// pending for the next run.
    pub async fn resolve_pending(&self, lark: &LarkClient, limit: usize) -> Result<ResolveStats> {
        let mut stats = ResolveStats::default();
        if self.email_domains.is_empty() {
            warn!("no user mapping email domains configured; nothing to resolve");
            return Ok(stats);
        }

        let pending = self.cache.incomplete()?;
        for username in pending.into_iter().take(limit) {
            stats.attempted += 1;
            let mut resolved = None;
            let mut lookup_failed = false;
            for email in self.candidate_emails(&username) {
                match lark.lookup_user(&email).await {
                    Ok(Some(found)) => {
                        resolved = Some(LarkUserRef {
                            email,
                            user_id: found.user_id,
                            name: found.name,
                        });
                        break;
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        warn!("directory lookup for {} failed: {}", email, err);
                        lookup_failed = true;
                        break;
                    }
                }
            }
            if let Some(user) = resolved {
                info!("resolved user {} -> {}", username, user.user_id);
                self.cache.put_valid(&username, &user)?;
                stats.resolved += 1;
            } else if lookup_failed {
                // Leave pending; a later run retries.
                stats.skipped += 1;
            } else {
                // Every domain answered "no such user".
                self.cache.put_empty(&username)?;
                stats.empty += 1;
            }
        }
        info!(
            "pending user resolution: {} attempted, {} resolved, {} empty, {} skipped",
            stats.attempted, stats.resolved, stats.empty, stats.skipped
        );
        Ok(stats)
    }

    pub fn cache(&self) -> &UserCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Arc<UserCache> {
        Arc::new(UserCache::open_in_memory().expect("should create in-memory cache"))
    }

    fn valid_ref() -> LarkUserRef {
        LarkUserRef {
            email: "alice@example.com".to_string(),
            user_id: "ou_123".to_string(),
            name: Some("Alice".to_string()),
        }
    }

    #[test]
    fn test_get_missing_returns_none() {
        let cache = cache();
        assert!(cache.get("nobody").unwrap().is_none());
    }

    #[test]
    fn test_valid_roundtrip() {
        let cache = cache();
        cache.put_valid("alice", &valid_ref()).unwrap();
        assert_eq!(
            cache.get("alice").unwrap(),
            Some(UserState::Valid(valid_ref()))
        );
    }

    #[test]
    fn test_mark_pending_does_not_downgrade_valid() {
        let cache = cache();
        cache.put_valid("alice", &valid_ref()).unwrap();
        let inserted = cache.mark_pending("alice").unwrap();
        assert!(!inserted);
        assert!(matches!(
            cache.get("alice").unwrap(),
            Some(UserState::Valid(_))
        ));
    }

    #[test]
    fn test_mark_pending_does_not_downgrade_empty() {
        let cache = cache();
        cache.put_empty("bob").unwrap();
        cache.mark_pending("bob").unwrap();
        assert_eq!(cache.get("bob").unwrap(), Some(UserState::Empty));
    }

    #[test]
    fn test_reopen_forces_pending() {
        let cache = cache();
        cache.put_empty("bob").unwrap();
        cache.reopen("bob").unwrap();
        assert_eq!(cache.get("bob").unwrap(), Some(UserState::Pending));
    }

    #[test]
    fn test_pending_transitions_to_valid_and_empty() {
        let cache = cache();
        cache.mark_pending("alice").unwrap();
        cache.mark_pending("bob").unwrap();
        cache.put_valid("alice", &valid_ref()).unwrap();
        cache.put_empty("bob").unwrap();

        assert!(matches!(
            cache.get("alice").unwrap(),
            Some(UserState::Valid(_))
        ));
        assert_eq!(cache.get("bob").unwrap(), Some(UserState::Empty));
        assert!(cache.incomplete().unwrap().is_empty());
    }

    #[test]
    fn test_incomplete_lists_pending_only() {
        let cache = cache();
        cache.mark_pending("carol").unwrap();
        cache.put_valid("alice", &valid_ref()).unwrap();
        cache.put_empty("bob").unwrap();

        assert_eq!(cache.incomplete().unwrap(), vec!["carol".to_string()]);
        assert_eq!(cache.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_batch_get() {
        let cache = cache();
        cache.put_valid("alice", &valid_ref()).unwrap();
        cache.mark_pending("carol").unwrap();

        let states = cache
            .batch_get(&["alice".to_string(), "carol".to_string(), "dave".to_string()])
            .unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states.get("carol"), Some(&UserState::Pending));
    }

    #[test]
    fn test_extract_username() {
        assert_eq!(
            UserMapper::extract_username("alice@example.com"),
            Some("alice".to_string())
        );
        assert_eq!(
            UserMapper::extract_username("bob"),
            Some("bob".to_string())
        );
        assert_eq!(UserMapper::extract_username("  "), None);
        assert_eq!(UserMapper::extract_username("@example.com"), None);
    }

    #[test]
    fn test_map_user_unknown_becomes_pending() {
        let cache = cache();
        let mapper = UserMapper::new(cache.clone(), vec!["example.com".to_string()]);

        let value = mapper.map_user(&json!({ "name": "alice", "displayName": "Alice" }));
        assert!(value.is_empty());
        assert_eq!(cache.get("alice").unwrap(), Some(UserState::Pending));
    }

    #[test]
    fn test_map_user_valid_produces_person_list() {
        let cache = cache();
        cache.put_valid("alice", &valid_ref()).unwrap();
        let mapper = UserMapper::new(cache, vec!["example.com".to_string()]);

        let value = mapper.map_user(&json!({ "emailAddress": "alice@jira.example.com" }));
        assert_eq!(value, vec![json!({ "id": "ou_123" })]);
    }

    #[test]
    fn test_map_user_empty_projects_no_person() {
        let cache = cache();
        cache.put_empty("ghost").unwrap();
        let mapper = UserMapper::new(cache, vec![]);

        let value = mapper.map_user(&json!({ "name": "ghost" }));
        assert!(value.is_empty());
    }

    #[test]
    fn test_candidate_emails_support_suffix_entries() {
        let mapper = UserMapper::new(
            cache(),
            vec!["example.com".to_string(), ".ops@gmail.com".to_string()],
        );
        assert_eq!(
            mapper.candidate_emails("alice"),
            vec![
                "alice@example.com".to_string(),
                "alice.ops@gmail.com".to_string()
            ]
        );
    }
}
