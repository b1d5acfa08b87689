//! Declarative per-source rule sets. A new source is a new `SourceRules`
//! value (built in, or loaded from a file), never a new code path.

mod catalog;

pub use catalog::{PipelineDefinition, SourceCatalog};

use crate::load::resolve_primary_key;
use crate::models::format_number;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHANGE_COLUMN: &str = "updated_at";
pub const INGESTED_AT_COLUMN: &str = "ingested_at";
pub const SOURCE_FILE_COLUMN: &str = "source_file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Float,
    Timestamp,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Float => "float",
            ColumnType::Timestamp => "timestamp",
        }
    }
}

fn default_column_type() -> ColumnType {
    ColumnType::Text
}

/// A canonical column and the alternate spellings it is read from, in
/// priority order after the canonical name itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_column_type")]
    pub kind: ColumnType,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            aliases: Vec::new(),
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRule {
    pub column: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub exclusive_min: bool,
    /// A null value counts as out of range.
    #[serde(default)]
    pub required: bool,
}

impl RangeRule {
    pub fn contains(&self, value: f64) -> bool {
        let above = match self.min {
            Some(min) if self.exclusive_min => value > min,
            Some(min) => value >= min,
            None => true,
        };
        let below = self.max.is_none_or(|max| value <= max);
        above && below
    }

    pub fn describe(&self) -> String {
        match (self.min, self.max) {
            (Some(min), Some(max)) => format!(
                "{} must be between {} and {}",
                self.column,
                format_number(min),
                format_number(max)
            ),
            (Some(min), None) if self.exclusive_min => {
                format!("{} must be > {}", self.column, format_number(min))
            }
            (Some(min), None) => format!("{} must be >= {}", self.column, format_number(min)),
            (None, Some(max)) => format!("{} must be <= {}", self.column, format_number(max)),
            (None, None) => format!("{} must be numeric", self.column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateWindowRule {
    pub column: String,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reject_future: bool,
}

/// When `when_column` equals `equals` (trimmed, case-insensitive),
/// `require_column` must be non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRule {
    pub when_column: String,
    pub equals: String,
    pub require_column: String,
}

/// Values of `column` must exist as `key_column` in destination `table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRule {
    pub column: String,
    pub table: String,
    pub key_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub column: String,
    pub allowed: Vec<String>,
    #[serde(default)]
    pub allow_null: bool,
}

/// Within-batch identifier uniqueness. `hard` duplicates fail the batch,
/// soft ones are only counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueKeyRule {
    pub column: String,
    #[serde(default)]
    pub hard: bool,
}

fn default_change_column() -> Option<String> {
    Some(DEFAULT_CHANGE_COLUMN.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRules {
    pub name: String,
    /// Relational table; defaults to the source name.
    #[serde(default)]
    pub table: Option<String>,
    pub columns: Vec<ColumnSpec>,
    #[serde(default = "default_change_column")]
    pub change_column: Option<String>,
    #[serde(default)]
    pub required_columns: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub optional_fields: Vec<String>,
    #[serde(default)]
    pub ranges: Vec<RangeRule>,
    #[serde(default)]
    pub date_windows: Vec<DateWindowRule>,
    #[serde(default)]
    pub conditionals: Vec<ConditionalRule>,
    #[serde(default)]
    pub references: Vec<ReferenceRule>,
    #[serde(default)]
    pub categories: Vec<CategoryRule>,
    #[serde(default)]
    pub unique_key: Option<UniqueKeyRule>,
}

impl SourceRules {
    pub fn new(name: &str, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.to_string(),
            table: None,
            columns,
            change_column: default_change_column(),
            required_columns: Vec::new(),
            required_fields: Vec::new(),
            optional_fields: Vec::new(),
            ranges: Vec::new(),
            date_windows: Vec::new(),
            conditionals: Vec::new(),
            references: Vec::new(),
            categories: Vec::new(),
            unique_key: None,
        }
    }

    pub fn table(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    /// Conflict key of the relational table, resolved over the declared
    /// columns. Both the table DDL and the upsert target use it.
    pub fn primary_key(&self) -> Option<String> {
        resolve_primary_key(&self.name, &self.column_names())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_descriptions() {
        let positive = RangeRule {
            column: "principal_amount".into(),
            min: Some(0.0),
            max: None,
            exclusive_min: true,
            required: true,
        };
        assert_eq!(positive.describe(), "principal_amount must be > 0");
        assert!(!positive.contains(0.0));
        assert!(positive.contains(0.01));

        let duration = RangeRule {
            column: "call_duration_sec".into(),
            min: Some(0.0),
            max: Some(7200.0),
            exclusive_min: false,
            required: true,
        };
        assert_eq!(
            duration.describe(),
            "call_duration_sec must be between 0 and 7200"
        );
        assert!(duration.contains(0.0));
        assert!(duration.contains(7200.0));
        assert!(!duration.contains(9000.0));
        assert!(!duration.contains(-1.0));
    }

    #[test]
    fn test_candidates_start_with_canonical_name() {
        let spec = ColumnSpec::new("call_duration_sec", ColumnType::Float).alias("duration_seconds");
        let candidates: Vec<&str> = spec.candidates().collect();
        assert_eq!(candidates, vec!["call_duration_sec", "duration_seconds"]);
    }
}
