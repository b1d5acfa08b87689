//! Maps raw records onto a source's canonical schema: alias resolution,
//! type coercion and dropping of unknown columns.

use crate::models::{SourceRow, Value, parse_timestamp};
use crate::rules::{ColumnType, SourceRules};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const MAX_LISTED_ROWS: usize = 25;

/// Renders offending row indices the way every rule message does.
pub(crate) fn format_rows(rows: &[usize]) -> String {
    if rows.len() > MAX_LISTED_ROWS {
        format!(
            "{:?} (+{} more)",
            &rows[..MAX_LISTED_ROWS],
            rows.len() - MAX_LISTED_ROWS
        )
    } else {
        format!("{:?}", rows)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoercionIssue {
    pub column: String,
    pub kind: ColumnType,
    pub rows: Vec<usize>,
}

impl CoercionIssue {
    pub fn message(&self) -> String {
        match self.kind {
            ColumnType::Float => format!(
                "{} must be numeric at rows: {}",
                self.column,
                format_rows(&self.rows)
            ),
            _ => format!(
                "Invalid {} format at rows: {}",
                self.column,
                format_rows(&self.rows)
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBatch {
    pub rows: Vec<SourceRow>,
    /// Canonical column order of the source.
    pub columns: Vec<String>,
    /// Canonical columns for which the input carried at least one candidate.
    pub present_columns: BTreeSet<String>,
    pub issues: Vec<CoercionIssue>,
}

impl NormalizedBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_present(&self, column: &str) -> bool {
        self.present_columns.contains(column)
    }
}

/// Union of keys across rows, for inputs that carry no header.
pub fn header_of(rows: &[SourceRow]) -> Vec<String> {
    let mut header = BTreeSet::new();
    for row in rows {
        header.extend(row.keys().cloned());
    }
    header.into_iter().collect()
}

pub fn normalize(rules: &SourceRules, header: &[String], raw: Vec<SourceRow>) -> NormalizedBatch {
    let header: BTreeSet<&str> = header.iter().map(String::as_str).collect();
    let present_columns: BTreeSet<String> = rules
        .columns
        .iter()
        .filter(|spec| spec.candidates().any(|c| header.contains(c)))
        .map(|spec| spec.name.clone())
        .collect();

    let mut failures: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut rows = Vec::with_capacity(raw.len());

    for (row_idx, record) in raw.into_iter().enumerate() {
        let mut row = SourceRow::new();
        for (col_idx, spec) in rules.columns.iter().enumerate() {
            let picked = spec
                .candidates()
                .filter_map(|candidate| record.get(candidate))
                .find(|value| !value.is_blank());

            let value = match picked {
                None => Value::Null,
                Some(value) => match coerce(value, spec.kind) {
                    Some(value) => value,
                    None => {
                        failures.entry(col_idx).or_default().push(row_idx);
                        Value::Null
                    }
                },
            };
            row.insert(spec.name.clone(), value);
        }
        rows.push(row);
    }

    let issues = failures
        .into_iter()
        .map(|(col_idx, rows)| CoercionIssue {
            column: rules.columns[col_idx].name.clone(),
            kind: rules.columns[col_idx].kind,
            rows,
        })
        .collect();

    NormalizedBatch {
        rows,
        columns: rules.column_names(),
        present_columns,
        issues,
    }
}

fn coerce(value: &Value, kind: ColumnType) -> Option<Value> {
    match (kind, value) {
        (_, Value::Null) => Some(Value::Null),
        (ColumnType::Text, Value::Text(s)) => Some(Value::Text(s.trim().to_string())),
        (ColumnType::Text, other) => other.to_key().map(Value::Text),
        (ColumnType::Float, Value::Number(n)) => Some(Value::Number(*n)),
        (ColumnType::Float, Value::Text(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(Value::Number),
        (ColumnType::Float, Value::Timestamp(_)) => None,
        (ColumnType::Timestamp, Value::Timestamp(ts)) => Some(Value::Timestamp(*ts)),
        (ColumnType::Timestamp, Value::Text(s)) => parse_timestamp(s).map(Value::Timestamp),
        (ColumnType::Timestamp, Value::Number(_)) => None,
    }
}
