//! The sync pipeline: configuration, per-table processing logs, the batch
//! upsert planner, the per-binding workflow, and the scheduler that drives
//! them.

pub mod batch;
pub mod config;
pub mod processing_log;
pub mod scheduler;
pub mod status;
pub mod workflow;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};

use larksync_core::{FieldProcessor, JiraClient, LarkClient, UserCache, UserMapper};

use crate::config::Config;
use crate::processing_log::ProcessingLog;

/// Everything a cycle needs, wired once at startup and shared across
/// workers. No process-wide singletons: the context is passed explicitly to
/// the scheduler and the workflows.
///
/// The configuration is a swappable snapshot: the scheduler installs a new
/// one when the config file changes, and it takes effect at the next tick.
/// Client credentials and the field schema are captured at startup; changing
/// those requires a restart.
pub struct SyncContext {
    config: RwLock<Arc<Config>>,
    pub jira: Arc<JiraClient>,
    pub lark: Arc<LarkClient>,
    pub field_processor: Arc<FieldProcessor>,
    pub user_cache: Arc<UserCache>,
    pub user_mapper: Option<UserMapper>,
    logs: Mutex<HashMap<String, Arc<ProcessingLog>>>,
    cold_start_requests: Mutex<HashSet<String>>,
}

impl SyncContext {
    pub fn from_config(config: Config) -> Result<Self> {
        let jira = Arc::new(
            JiraClient::new(&config.jira_settings()).context("Failed to build JIRA client")?,
        );
        let lark = Arc::new(
            LarkClient::new(&config.lark_settings()).context("Failed to build Lark client")?,
        );

        std::fs::create_dir_all(&config.global.data_directory).with_context(|| {
            format!(
                "Failed to create data directory {:?}",
                config.global.data_directory
            )
        })?;
        let user_cache = Arc::new(
            UserCache::open(&config.user_cache_path()).context("Failed to open user cache")?,
        );

        let user_mapper = config.user_mapping.enabled.then(|| {
            UserMapper::new(
                user_cache.clone(),
                config.user_mapping.email_domains.clone(),
            )
        });

        let field_processor = Arc::new(FieldProcessor::new(
            &config.jira.server_url,
            config.issue_link_rules.clone(),
            user_mapper.clone(),
        ));

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            jira,
            lark,
            field_processor,
            user_cache,
            user_mapper,
            logs: Mutex::new(HashMap::new()),
            cold_start_requests: Mutex::new(HashSet::new()),
        })
    }

    /// The current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().expect("lock poisoned").clone()
    }

    /// Install a new configuration snapshot. In-flight cycles keep the one
    /// they captured.
    pub fn install_config(&self, config: Config) {
        *self.config.write().expect("lock poisoned") = Arc::new(config);
    }

    /// The processing log for a table, opened on first use and cached.
    pub fn processing_log(&self, table_id: &str) -> Result<Arc<ProcessingLog>> {
        let mut logs = self.logs.lock().expect("lock poisoned");
        if let Some(log) = logs.get(table_id) {
            return Ok(log.clone());
        }
        let data_dir = self.config().global.data_directory.clone();
        let log = Arc::new(ProcessingLog::open(&data_dir, table_id)?);
        logs.insert(table_id.to_string(), log.clone());
        Ok(log)
    }

    /// Ask the next cycle of a table to re-run cold start (used after a
    /// stale sink row id is detected).
    pub fn request_cold_start(&self, table_id: &str) {
        self.cold_start_requests
            .lock()
            .expect("lock poisoned")
            .insert(table_id.to_string());
    }

    /// Consume a pending cold-start request for a table.
    pub fn take_cold_start_request(&self, table_id: &str) -> bool {
        self.cold_start_requests
            .lock()
            .expect("lock poisoned")
            .remove(table_id)
    }
}
