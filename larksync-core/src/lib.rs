//! Core building blocks for the JIRA → Lark Base sync pipeline: the two API
//! clients, the field-mapping schema and projection engine, the user-mapping
//! cache, and transport-level error classification and retry.
//!
//! Everything stateful against the outside world lives here; the sync
//! orchestration (processing log, batch planner, workflow, scheduler) lives
//! in `larksync-server`.

pub mod error;
pub mod fields;
pub mod jira;
pub mod lark;
pub mod retry;
pub mod schema;
pub mod users;

pub use error::ApiError;
pub use fields::{parse_source_timestamp, FieldProcessor, ProjectionError};
pub use jira::{Issue, JiraClient, JiraSettings};
pub use lark::{LarkClient, LarkSettings, LarkUser, Record};
pub use schema::{
    build_plan, required_source_fields, FieldMapping, LinkRule, PlanError, Processor,
    ProjectionPlan, SinkField, TableField, HYPERLINK_FIELD_TYPE,
};
pub use users::{LarkUserRef, ResolveStats, UserCache, UserMapper, UserState};
