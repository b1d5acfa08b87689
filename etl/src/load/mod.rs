//! Fail-closed loaders for the two destination disciplines. Both write the
//! batch's audit entry in the same unit of work as its rows.

mod append;
mod upsert;

pub use append::AppendLoader;
pub use upsert::UpsertLoader;

use crate::audit::IngestionLog;
use crate::extract::change_instant;
use crate::models::{IngestionLogEntry, LoadResult, SourceRow, ValidationReport};
use crate::normalize::NormalizedBatch;
use crate::rules::ColumnSpec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Result;
use std::collections::HashMap;
use tracing::warn;

/// Relational destination with insert-or-update semantics.
#[async_trait]
pub trait RelationalSink: IngestionLog {
    /// Upserts `rows` on `key_column` and appends `entry`, atomically.
    async fn upsert_with_log(
        &self,
        table: &str,
        key_column: &str,
        columns: &[String],
        rows: &[SourceRow],
        entry: &IngestionLogEntry,
    ) -> Result<usize>;
}

/// Append-only analytical destination. Returns the written object's key.
#[async_trait]
pub trait AppendSink: IngestionLog {
    async fn append(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        rows: &[SourceRow],
        entry: &IngestionLogEntry,
    ) -> Result<String>;
}

/// `id` when present, else the source name without trailing `s` plus `_id`,
/// else the first column.
pub fn resolve_primary_key(source_name: &str, columns: &[String]) -> Option<String> {
    if columns.iter().any(|c| c == "id") {
        return Some("id".to_string());
    }
    let derived = format!("{}_id", source_name.trim_end_matches('s'));
    if columns.contains(&derived) {
        return Some(derived);
    }
    columns.first().cloned()
}

/// Rows that will actually be written, plus everything held back.
pub(crate) struct PreparedRows {
    pub rows: Vec<SourceRow>,
    pub skipped: usize,
}

/// Drops warning rows and, when a collapse key is given, keeps only the last
/// occurrence of each key.
pub(crate) fn prepare_rows(
    batch: &NormalizedBatch,
    report: &ValidationReport,
    collapse_key: Option<&str>,
) -> PreparedRows {
    let kept: Vec<&SourceRow> = batch
        .rows
        .iter()
        .enumerate()
        .filter(|(idx, _)| !report.warning_rows.contains(idx))
        .map(|(_, row)| row)
        .collect();

    let rows: Vec<SourceRow> = match collapse_key {
        None => kept.into_iter().cloned().collect(),
        Some(key) => {
            let mut last_seen: HashMap<String, usize> = HashMap::new();
            for (pos, row) in kept.iter().enumerate() {
                if let Some(k) = row.get(key).and_then(|v| v.to_key()) {
                    last_seen.insert(k, pos);
                }
            }
            kept.iter()
                .enumerate()
                .filter(|(pos, row)| match row.get(key).and_then(|v| v.to_key()) {
                    Some(k) => last_seen.get(&k) == Some(pos),
                    None => true,
                })
                .map(|(_, row)| (*row).clone())
                .collect()
        }
    };

    PreparedRows {
        skipped: batch.len() - rows.len(),
        rows,
    }
}

pub(crate) fn max_change(rows: &[SourceRow], change_column: Option<&str>) -> Option<DateTime<Utc>> {
    let column = change_column?;
    rows.iter().filter_map(|row| change_instant(row, column)).max()
}

/// Best-effort audit of a load that wrote nothing.
pub(crate) async fn record_failure<L: IngestionLog + ?Sized>(
    log: &L,
    source: &str,
    batch_id: &str,
    loaded_at: DateTime<Utc>,
    result: &LoadResult,
) {
    let entry = IngestionLogEntry::from_result(source, batch_id, loaded_at, result);
    if let Err(err) = log.record(&entry).await {
        warn!(source, batch_id, error = %err, "Could not record failed load");
    }
}
