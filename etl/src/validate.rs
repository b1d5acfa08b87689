use crate::models::{SourceRow, ValidationReport, Value};
use crate::normalize::{NormalizedBatch, format_rows};
use crate::rules::{CategoryRule, DateWindowRule, RangeRule, SourceRules, UniqueKeyRule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Result;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Existence checks against destination tables for reference rules.
#[async_trait]
pub trait ReferenceLookup: Send + Sync {
    /// The subset of `keys` present in `table.column`.
    async fn existing_keys(
        &self,
        table: &str,
        column: &str,
        keys: &[String],
    ) -> Result<HashSet<String>>;
}

/// Checks a normalized batch against a source rule set. Each rule adds at
/// most one message to the report.
pub struct Validator {
    rules: SourceRules,
    lookup: Option<Arc<dyn ReferenceLookup>>,
    now: Option<DateTime<Utc>>,
}

impl Validator {
    pub fn new(rules: SourceRules) -> Self {
        Self {
            rules,
            lookup: None,
            now: None,
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn ReferenceLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Fixes "now" for future-date checks.
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn rules(&self) -> &SourceRules {
        &self.rules
    }

    pub async fn validate(&self, batch: &NormalizedBatch) -> ValidationReport {
        let mut report = ValidationReport {
            null_counts: null_counts(batch),
            ..Default::default()
        };

        let missing: Vec<&String> = self
            .rules
            .required_columns
            .iter()
            .filter(|c| !batch.is_present(c))
            .collect();
        if !missing.is_empty() {
            for column in missing {
                report
                    .errors
                    .push(format!("Missing required column: {}", column));
            }
            return report;
        }

        for column in &self.rules.required_fields {
            let rows = rows_where(&batch.rows, |row| cell(row, column).is_blank());
            if !rows.is_empty() {
                report.errors.push(format!(
                    "Null/empty {} at rows: {}",
                    column,
                    format_rows(&rows)
                ));
            }
        }

        for issue in &batch.issues {
            report.errors.push(issue.message());
        }

        if let Some(rule) = &self.rules.unique_key {
            check_unique(rule, batch, &mut report);
        }

        for rule in &self.rules.ranges {
            if batch.is_present(&rule.column) {
                push_rows(&mut report, check_range(rule, &batch.rows), |rows| {
                    format!("{} at rows: {}", rule.describe(), rows)
                });
            }
        }

        let now = self.now.unwrap_or_else(Utc::now);
        for rule in &self.rules.date_windows {
            if batch.is_present(&rule.column) {
                check_date_window(rule, &batch.rows, now, &mut report);
            }
        }

        for rule in &self.rules.categories {
            if batch.is_present(&rule.column) {
                push_rows(&mut report, check_category(rule, &batch.rows), |rows| {
                    format!(
                        "Invalid {} (allowed: {}) at rows: {}",
                        rule.column,
                        rule.allowed.join(","),
                        rows
                    )
                });
            }
        }

        for rule in &self.rules.conditionals {
            if !batch.is_present(&rule.when_column) {
                continue;
            }
            let rows = rows_where(&batch.rows, |row| {
                cell(row, &rule.when_column)
                    .to_key()
                    .is_some_and(|v| v.eq_ignore_ascii_case(&rule.equals))
                    && cell(row, &rule.require_column).is_blank()
            });
            push_rows(&mut report, rows, |rows| {
                format!(
                    "{} must be non-empty when {}={} at rows: {}",
                    rule.require_column, rule.when_column, rule.equals, rows
                )
            });
        }

        self.check_references(batch, &mut report).await;

        for column in &self.rules.optional_fields {
            if batch.is_present(column) {
                report
                    .warning_rows
                    .extend(rows_where(&batch.rows, |row| cell(row, column).is_blank()));
            }
        }

        debug!(
            source = %self.rules.name,
            rows = batch.len(),
            errors = report.errors.len(),
            warnings = report.warning_rows.len(),
            duplicates = report.duplicate_count,
            "Validated batch"
        );
        report
    }

    async fn check_references(&self, batch: &NormalizedBatch, report: &mut ValidationReport) {
        for rule in &self.rules.references {
            if !batch.is_present(&rule.column) {
                continue;
            }
            let Some(lookup) = &self.lookup else {
                warn!(
                    source = %self.rules.name,
                    column = %rule.column,
                    "No reference lookup configured, skipping existence check"
                );
                continue;
            };

            let keys: Vec<String> = batch
                .rows
                .iter()
                .filter_map(|row| cell(row, &rule.column).to_key())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if keys.is_empty() {
                continue;
            }

            match lookup.existing_keys(&rule.table, &rule.key_column, &keys).await {
                Ok(existing) => {
                    let rows = rows_where(&batch.rows, |row| {
                        cell(row, &rule.column)
                            .to_key()
                            .is_some_and(|key| !existing.contains(&key))
                    });
                    push_rows(report, rows, |rows| {
                        format!(
                            "{} does not exist in {} table at rows: {}",
                            rule.column, rule.table, rows
                        )
                    });
                }
                Err(err) => {
                    report
                        .errors
                        .push(format!("FK validation query failed: {}", err));
                }
            }
        }
    }
}

static NULL: Value = Value::Null;

fn cell<'a>(row: &'a SourceRow, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&NULL)
}

fn rows_where(rows: &[SourceRow], pred: impl Fn(&SourceRow) -> bool) -> Vec<usize> {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| pred(row))
        .map(|(idx, _)| idx)
        .collect()
}

fn push_rows(report: &mut ValidationReport, rows: Vec<usize>, message: impl Fn(&str) -> String) {
    if !rows.is_empty() {
        report.errors.push(message(&format_rows(&rows)));
    }
}

fn null_counts(batch: &NormalizedBatch) -> BTreeMap<String, usize> {
    batch
        .present_columns
        .iter()
        .map(|column| {
            let nulls = batch
                .rows
                .iter()
                .filter(|row| cell(row, column).is_blank())
                .count();
            (column.clone(), nulls)
        })
        .collect()
}

fn check_unique(rule: &UniqueKeyRule, batch: &NormalizedBatch, report: &mut ValidationReport) {
    if !batch.is_present(&rule.column) {
        return;
    }
    let mut seen: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, row) in batch.rows.iter().enumerate() {
        if let Some(key) = cell(row, &rule.column).to_key() {
            seen.entry(key).or_default().push(idx);
        }
    }

    let mut involved = Vec::new();
    for rows in seen.values().filter(|rows| rows.len() > 1) {
        report.duplicate_count += rows.len() - 1;
        involved.extend_from_slice(rows);
    }
    involved.sort_unstable();

    if rule.hard && !involved.is_empty() {
        report.errors.push(format!(
            "Duplicate {} found at rows: {}",
            rule.column,
            format_rows(&involved)
        ));
    }
}

fn check_range(rule: &RangeRule, rows: &[SourceRow]) -> Vec<usize> {
    rows_where(rows, |row| match cell(row, &rule.column).as_f64() {
        Some(value) => !rule.contains(value),
        None => rule.required,
    })
}

fn check_date_window(
    rule: &DateWindowRule,
    rows: &[SourceRow],
    now: DateTime<Utc>,
    report: &mut ValidationReport,
) {
    if let Some(floor) = rule.not_before {
        let early = rows_where(rows, |row| {
            cell(row, &rule.column)
                .as_timestamp()
                .is_some_and(|ts| ts < floor)
        });
        push_rows(report, early, |rows| {
            format!(
                "{} earlier than {} at rows: {}",
                rule.column,
                floor.format("%Y-%m-%d"),
                rows
            )
        });
    }
    if rule.reject_future {
        let future = rows_where(rows, |row| {
            cell(row, &rule.column)
                .as_timestamp()
                .is_some_and(|ts| ts > now)
        });
        push_rows(report, future, |rows| {
            format!("{} is in the future at rows: {}", rule.column, rows)
        });
    }
}

fn check_category(rule: &CategoryRule, rows: &[SourceRow]) -> Vec<usize> {
    rows_where(rows, |row| match cell(row, &rule.column).to_key() {
        Some(value) if !value.is_empty() => {
            let value = value.to_uppercase();
            !rule.allowed.iter().any(|a| a.eq_ignore_ascii_case(&value))
        }
        _ => !rule.allow_null,
    })
}
