//! Configuration: one YAML file describing the JIRA source, the Lark sink,
//! the field-mapping schema, and the team/table bindings.
//!
//! Interval resolution is hierarchical: a table's `sync_interval` wins over
//! its team's, which wins over `global.default_sync_interval`. Paths in the
//! file (the CA certificate) are resolved relative to the config file's
//! directory when not absolute.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use larksync_core::{JiraSettings, LarkSettings, LinkRule, FieldMapping, Processor};

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sync_interval() -> u64 {
    300
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    pub jira: JiraFileConfig,
    pub lark_base: LarkFileConfig,
    #[serde(default)]
    pub user_mapping: UserMappingConfig,
    pub field_mappings: BTreeMap<String, FieldMapping>,
    #[serde(default)]
    pub issue_link_rules: BTreeMap<String, LinkRule>,
    #[serde(default)]
    pub teams: BTreeMap<String, TeamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_sync_interval")]
    pub default_sync_interval: u64,
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            default_sync_interval: default_sync_interval(),
            data_directory: default_data_directory(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraFileConfig {
    pub server_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LarkFileConfig {
    pub app_id: String,
    pub app_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMappingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub email_domains: Vec<String>,
}

impl Default for UserMappingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            email_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sync_interval: Option<u64>,
    pub wiki_token: String,
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub table_id: String,
    pub jql: String,
    #[serde(default)]
    pub sync_interval: Option<u64>,
    #[serde(default)]
    pub excluded_fields: Vec<String>,
    #[serde(default)]
    pub ticket_field: Option<String>,
}

/// One enabled `(team, table)` pair with everything a cycle needs.
#[derive(Debug, Clone)]
pub struct Binding {
    pub team: String,
    pub table: String,
    pub wiki_token: String,
    pub table_id: String,
    pub jql: String,
    pub interval: Duration,
    pub excluded_fields: Vec<String>,
    pub ticket_field: Option<String>,
}

impl Binding {
    pub fn key(&self) -> (String, String) {
        (self.team.clone(), self.table.clone())
    }
}

impl Config {
    /// Load and validate a configuration file. Relative paths inside the
    /// file are resolved against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let mut config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;

        let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
        if let Some(ca_path) = &config.jira.ca_cert_path {
            if ca_path.is_relative() {
                config.jira.ca_cert_path = Some(config_dir.join(ca_path));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.jira.server_url.trim().is_empty() {
            errors.push("jira.server_url is empty".to_string());
        }
        if !self
            .field_mappings
            .values()
            .any(|m| m.processor == Processor::ExtractTicketLink)
        {
            errors.push(
                "field_mappings has no extract_ticket_link entry; the identity column is required"
                    .to_string(),
            );
        }
        for (team_name, team) in &self.teams {
            for (table_name, table) in &team.tables {
                if table.table_id.trim().is_empty() {
                    errors.push(format!(
                        "teams.{}.tables.{}.table_id is empty",
                        team_name, table_name
                    ));
                }
                if table.jql.trim().is_empty() {
                    errors.push(format!(
                        "teams.{}.tables.{}.jql is empty",
                        team_name, table_name
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration:\n  - {}", errors.join("\n  - "))
        }
    }

    /// Effective sync interval for a table, in seconds.
    pub fn sync_interval(&self, team: &str, table: &str) -> u64 {
        let team_config = self.teams.get(team);
        let table_interval = team_config
            .and_then(|t| t.tables.get(table))
            .and_then(|t| t.sync_interval);
        let team_interval = team_config.and_then(|t| t.sync_interval);
        table_interval
            .or(team_interval)
            .unwrap_or(self.global.default_sync_interval)
    }

    /// All enabled bindings, in stable team/table order.
    pub fn enabled_bindings(&self) -> Vec<Binding> {
        let mut bindings = Vec::new();
        for (team_name, team) in &self.teams {
            if !team.enabled {
                continue;
            }
            for (table_name, table) in &team.tables {
                if !table.enabled {
                    continue;
                }
                bindings.push(Binding {
                    team: team_name.clone(),
                    table: table_name.clone(),
                    wiki_token: team.wiki_token.clone(),
                    table_id: table.table_id.clone(),
                    jql: table.jql.clone(),
                    interval: Duration::from_secs(self.sync_interval(team_name, table_name)),
                    excluded_fields: table.excluded_fields.clone(),
                    ticket_field: table.ticket_field.clone(),
                });
            }
        }
        bindings
    }

    /// Find one enabled binding by team and table name.
    pub fn find_binding(&self, team: &str, table: &str) -> Option<Binding> {
        self.enabled_bindings()
            .into_iter()
            .find(|b| b.team == team && b.table == table)
    }

    pub fn jira_settings(&self) -> JiraSettings {
        JiraSettings {
            server_url: self.jira.server_url.clone(),
            username: self.jira.username.clone(),
            password: self.jira.password.clone(),
            timeout_secs: self.jira.timeout,
            ca_cert_path: self.jira.ca_cert_path.clone(),
        }
    }

    pub fn lark_settings(&self) -> LarkSettings {
        LarkSettings {
            app_id: self.lark_base.app_id.clone(),
            app_secret: self.lark_base.app_secret.clone(),
        }
    }

    pub fn user_cache_path(&self) -> PathBuf {
        self.global.data_directory.join("user_mapping_cache.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
global:
  log_level: debug
  default_sync_interval: 300
  data_directory: data

jira:
  server_url: https://jira.example.com
  username: sync-bot
  password: hunter2

lark_base:
  app_id: cli_123
  app_secret: shh

user_mapping:
  enabled: true
  email_domains: ["example.com"]

field_mappings:
  key:
    lark_field: ["Issue Key", "Ticket"]
    processor: extract_ticket_link
  summary:
    lark_field: "Title"
    processor: extract_simple

issue_link_rules:
  ICR:
    enabled: true
    display_link_prefixes: ["TP"]

teams:
  mgmt:
    enabled: true
    sync_interval: 600
    wiki_token: wik_abc
    tables:
      tp:
        enabled: true
        table_id: tbl_1
        jql: "project = TP"
        sync_interval: 120
        excluded_fields: ["summary"]
      icr:
        enabled: true
        table_id: tbl_2
        jql: "project = ICR"
  dormant:
    enabled: false
    wiki_token: wik_def
    tables:
      old:
        enabled: true
        table_id: tbl_3
        jql: "project = OLD"
"#;

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_sample() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, SAMPLE);
        let config = Config::load(&path).unwrap();

        assert_eq!(config.global.log_level, "debug");
        assert_eq!(config.jira.server_url, "https://jira.example.com");
        assert_eq!(config.teams.len(), 2);
    }

    #[test]
    fn test_interval_resolution() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&write_config(&dir, SAMPLE)).unwrap();

        // Table overrides team overrides global.
        assert_eq!(config.sync_interval("mgmt", "tp"), 120);
        assert_eq!(config.sync_interval("mgmt", "icr"), 600);
        assert_eq!(config.sync_interval("unknown", "x"), 300);
    }

    #[test]
    fn test_enabled_bindings_skip_disabled_teams() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&write_config(&dir, SAMPLE)).unwrap();

        let bindings = config.enabled_bindings();
        assert_eq!(bindings.len(), 2);
        assert!(bindings.iter().all(|b| b.team == "mgmt"));

        let tp = config.find_binding("mgmt", "tp").unwrap();
        assert_eq!(tp.table_id, "tbl_1");
        assert_eq!(tp.interval, Duration::from_secs(120));
        assert_eq!(tp.excluded_fields, vec!["summary".to_string()]);

        assert!(config.find_binding("dormant", "old").is_none());
    }

    #[test]
    fn test_relative_ca_cert_resolved_against_config_dir() {
        let dir = TempDir::new().unwrap();
        let with_cert = SAMPLE.replace(
            "  password: hunter2",
            "  password: hunter2\n  ca_cert_path: certs/ca.pem",
        );
        let config = Config::load(&write_config(&dir, &with_cert)).unwrap();
        assert_eq!(
            config.jira.ca_cert_path.unwrap(),
            dir.path().join("certs/ca.pem")
        );
    }

    #[test]
    fn test_absolute_ca_cert_left_alone() {
        let dir = TempDir::new().unwrap();
        let with_cert = SAMPLE.replace(
            "  password: hunter2",
            "  password: hunter2\n  ca_cert_path: /etc/ssl/ca.pem",
        );
        let config = Config::load(&write_config(&dir, &with_cert)).unwrap();
        assert_eq!(
            config.jira.ca_cert_path.unwrap(),
            PathBuf::from("/etc/ssl/ca.pem")
        );
    }

    #[test]
    fn test_missing_identity_mapping_rejected() {
        let dir = TempDir::new().unwrap();
        let broken = SAMPLE.replace("extract_ticket_link", "extract_simple");
        let err = Config::load(&write_config(&dir, &broken)).unwrap_err();
        assert!(err.to_string().contains("extract_ticket_link"));
    }

    #[test]
    fn test_empty_jql_rejected() {
        let dir = TempDir::new().unwrap();
        let broken = SAMPLE.replace("jql: \"project = TP\"", "jql: \"\"");
        let err = Config::load(&write_config(&dir, &broken)).unwrap_err();
        assert!(err.to_string().contains("jql is empty"));
    }
}
