//! Field-mapping schema: which source fields flow into which sink columns,
//! and through which processor.
//!
//! The schema is declared in the YAML configuration as a map from a source
//! field path (possibly dotted, e.g. `status.name`) to a sink column plus a
//! processor tag. The tag set is closed; each tag is one variant of
//! [`Processor`].

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

/// Bitable field type code for hyperlink (URL) columns. The identity column
/// that carries the issue key must be of this type.
pub const HYPERLINK_FIELD_TYPE: i64 = 15;

/// One column of a live sink table, as reported by the field-listing API.
#[derive(Debug, Clone, Deserialize)]
pub struct TableField {
    pub field_name: String,
    #[serde(rename = "type")]
    pub field_type: i64,
}

/// Sink column reference: either a single column name, or an ordered list of
/// candidate names of which the first one present on the live table wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SinkField {
    Name(String),
    Candidates(Vec<String>),
}

impl SinkField {
    fn resolve(&self, available: &HashSet<&str>) -> Option<String> {
        match self {
            SinkField::Name(name) => available.contains(name.as_str()).then(|| name.clone()),
            SinkField::Candidates(names) => names
                .iter()
                .find(|name| available.contains(name.as_str()))
                .cloned(),
        }
    }
}

/// The closed set of field processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Processor {
    ExtractSimple,
    ExtractNested,
    ExtractUser,
    ConvertDatetime,
    ExtractComponents,
    ExtractVersions,
    ExtractLinks,
    ExtractLinksFiltered,
    ExtractTicketLink,
}

/// One schema entry: source path, sink column(s), processor and parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldMapping {
    pub lark_field: SinkField,
    pub processor: Processor,
    #[serde(default)]
    pub nested_path: Option<String>,
}

/// Per-project-prefix allowlist for the `extract_links_filtered` processor.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub display_link_prefixes: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// A schema entry resolved against a live table: concrete column name only.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub source_path: String,
    pub column: String,
    pub processor: Processor,
    pub nested_path: Option<String>,
}

/// The effective projection plan for one table: the schema filtered to
/// columns that exist on the live table, minus excluded fields, with the
/// identity column pinned down.
#[derive(Debug, Clone)]
pub struct ProjectionPlan {
    pub entries: Vec<PlanEntry>,
    pub identity_column: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("schema has no extract_ticket_link mapping")]
    NoIdentityMapping,
    #[error("no identity column candidate exists on the table: {candidates:?}")]
    IdentityColumnMissing { candidates: Vec<String> },
    #[error("identity column {column:?} is not hyperlink-typed (type {found})")]
    IdentityColumnNotHyperlink { column: String, found: i64 },
}

/// Build the projection plan for one table.
///
/// Mappings whose sink column does not exist on the live table are dropped
/// (the sink schema is authoritative for what we may write). Mappings listed
/// in `excluded_fields` (by source path) are dropped so their sink columns
/// are never touched. The identity mapping must resolve to a hyperlink-typed
/// column; anything else is a configuration error for the binding.
pub fn build_plan(
    mappings: &BTreeMap<String, FieldMapping>,
    table_fields: &[TableField],
    excluded_fields: &[String],
) -> Result<ProjectionPlan, PlanError> {
    let available: HashSet<&str> = table_fields
        .iter()
        .map(|f| f.field_name.as_str())
        .collect();

    let mut entries = Vec::new();
    let mut identity_column = None;

    for (source_path, mapping) in mappings {
        if excluded_fields.iter().any(|f| f == source_path) {
            continue;
        }
        let Some(column) = mapping.lark_field.resolve(&available) else {
            continue;
        };

        if mapping.processor == Processor::ExtractTicketLink {
            let field_type = table_fields
                .iter()
                .find(|f| f.field_name == column)
                .map(|f| f.field_type)
                .unwrap_or(0);
            if field_type != HYPERLINK_FIELD_TYPE {
                return Err(PlanError::IdentityColumnNotHyperlink {
                    column,
                    found: field_type,
                });
            }
            identity_column = Some(column.clone());
        }

        entries.push(PlanEntry {
            source_path: source_path.clone(),
            column,
            processor: mapping.processor,
            nested_path: mapping.nested_path.clone(),
        });
    }

    let identity_column = match identity_column {
        Some(column) => column,
        None => {
            let identity_mapping = mappings
                .values()
                .find(|m| m.processor == Processor::ExtractTicketLink)
                .ok_or(PlanError::NoIdentityMapping)?;
            let candidates = match &identity_mapping.lark_field {
                SinkField::Name(name) => vec![name.clone()],
                SinkField::Candidates(names) => names.clone(),
            };
            return Err(PlanError::IdentityColumnMissing { candidates });
        }
    };

    Ok(ProjectionPlan {
        entries,
        identity_column,
    })
}

/// The set of source fields a search must request to feed this schema.
///
/// Dotted paths contribute their top-level field (`status.name` → `status`);
/// `key` and `updated` are always included because the pipeline needs them
/// for identity and staleness filtering.
pub fn required_source_fields(mappings: &BTreeMap<String, FieldMapping>) -> Vec<String> {
    let mut fields: HashSet<String> = mappings
        .keys()
        .map(|path| path.split('.').next().unwrap_or(path).to_string())
        .collect();
    fields.insert("key".to_string());
    fields.insert("updated".to_string());

    let mut fields: Vec<String> = fields.into_iter().collect();
    fields.sort();
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings_yaml(yaml: &str) -> BTreeMap<String, FieldMapping> {
        serde_yaml::from_str(yaml).expect("schema yaml should parse")
    }

    fn sample_mappings() -> BTreeMap<String, FieldMapping> {
        mappings_yaml(
            r#"
            key:
              lark_field: ["Issue Key", "Ticket"]
              processor: extract_ticket_link
            summary:
              lark_field: "Title"
              processor: extract_simple
            status.name:
              lark_field: "Status"
              processor: extract_simple
            assignee:
              lark_field: "Assignee"
              processor: extract_user
            updated:
              lark_field: "Updated"
              processor: convert_datetime
            "#,
        )
    }

    fn table(fields: &[(&str, i64)]) -> Vec<TableField> {
        fields
            .iter()
            .map(|(name, ty)| TableField {
                field_name: (*name).to_string(),
                field_type: *ty,
            })
            .collect()
    }

    #[test]
    fn test_plan_resolves_first_present_candidate() {
        let fields = table(&[("Ticket", 15), ("Title", 1), ("Status", 1)]);
        let plan = build_plan(&sample_mappings(), &fields, &[]).unwrap();
        assert_eq!(plan.identity_column, "Ticket");
    }

    #[test]
    fn test_plan_prefers_earlier_candidate_when_both_exist() {
        // Both candidates are present and hyperlink-typed; configured order
        // decides.
        let fields = table(&[("Issue Key", 15), ("Ticket", 15), ("Title", 1)]);
        let plan = build_plan(&sample_mappings(), &fields, &[]).unwrap();
        assert_eq!(plan.identity_column, "Issue Key");
    }

    #[test]
    fn test_plan_drops_columns_missing_from_table() {
        let fields = table(&[("Issue Key", 15), ("Title", 1)]);
        let plan = build_plan(&sample_mappings(), &fields, &[]).unwrap();
        assert!(plan.entries.iter().all(|e| e.column != "Status"));
        assert!(plan.entries.iter().any(|e| e.column == "Title"));
    }

    #[test]
    fn test_plan_honors_excluded_fields() {
        let fields = table(&[("Issue Key", 15), ("Title", 1), ("Assignee", 11)]);
        let plan =
            build_plan(&sample_mappings(), &fields, &["assignee".to_string()]).unwrap();
        assert!(plan.entries.iter().all(|e| e.column != "Assignee"));
    }

    #[test]
    fn test_plan_rejects_non_hyperlink_identity() {
        let fields = table(&[("Issue Key", 1), ("Title", 1)]);
        let err = build_plan(&sample_mappings(), &fields, &[]).unwrap_err();
        assert!(matches!(
            err,
            PlanError::IdentityColumnNotHyperlink { .. }
        ));
    }

    #[test]
    fn test_plan_rejects_missing_identity_column() {
        let fields = table(&[("Title", 1)]);
        let err = build_plan(&sample_mappings(), &fields, &[]).unwrap_err();
        assert!(matches!(err, PlanError::IdentityColumnMissing { .. }));
    }

    #[test]
    fn test_required_source_fields_collapses_dotted_paths() {
        let fields = required_source_fields(&sample_mappings());
        assert!(fields.contains(&"status".to_string()));
        assert!(!fields.contains(&"status.name".to_string()));
        assert!(fields.contains(&"key".to_string()));
        assert!(fields.contains(&"updated".to_string()));
    }

    #[test]
    fn test_processor_tags_deserialize() {
        let mappings = mappings_yaml(
            r#"
            issuelinks:
              lark_field: "Related"
              processor: extract_links_filtered
            components:
              lark_field: "Components"
              processor: extract_components
            "#,
        );
        assert_eq!(
            mappings["issuelinks"].processor,
            Processor::ExtractLinksFiltered
        );
        assert_eq!(
            mappings["components"].processor,
            Processor::ExtractComponents
        );
    }
}
