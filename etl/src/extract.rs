use crate::models::{SourceRow, Value, Watermark, parse_timestamp};
use crate::rules::PipelineDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Relational source of change-tracked rows.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Rows with `change_column > after`, ascending by `change_column`,
    /// at most `limit` of them.
    async fn fetch_changes(
        &self,
        table: &str,
        change_column: &str,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SourceRow>>;

    async fn count_changed_since(
        &self,
        table: &str,
        change_column: &str,
        after: DateTime<Utc>,
    ) -> Result<u64>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedBatch {
    pub rows: Vec<SourceRow>,
    /// The page was full, more changes are probably waiting.
    pub truncated: bool,
}

/// Change instant of a raw row, whatever shape the source produced it in.
pub fn change_instant(row: &SourceRow, change_column: &str) -> Option<DateTime<Utc>> {
    match row.get(change_column)? {
        Value::Timestamp(ts) => Some(*ts),
        Value::Text(raw) => parse_timestamp(raw),
        _ => None,
    }
}

pub struct ChangeExtractor {
    source: Arc<dyn ChangeSource>,
    page_size: usize,
}

impl ChangeExtractor {
    pub fn new(source: Arc<dyn ChangeSource>, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
        }
    }

    pub async fn extract(
        &self,
        pipeline: &PipelineDefinition,
        watermark: &Watermark,
    ) -> Result<ExtractedBatch> {
        let mut rows = self
            .source
            .fetch_changes(
                &pipeline.source_table,
                &pipeline.change_column,
                watermark.value,
                self.page_size,
            )
            .await
            .map_err(|err| Error::Extraction {
                source_name: pipeline.source_name.clone(),
                message: err.to_string(),
            })?;

        for row in rows.iter_mut() {
            normalize_instants(row);
        }

        let truncated = rows.len() >= self.page_size;
        if truncated {
            hold_back_boundary_ties(&mut rows, &pipeline.change_column, &pipeline.source_name)?;
        }

        info!(
            source = %pipeline.source_name,
            watermark = %watermark.value.to_rfc3339(),
            rows = rows.len(),
            truncated,
            "Extracted changes"
        );
        Ok(ExtractedBatch { rows, truncated })
    }
}

/// Text cells holding a full date-time become UTC instants.
fn normalize_instants(row: &mut SourceRow) {
    for value in row.values_mut() {
        if let Value::Text(raw) = value {
            if raw.len() > 10 {
                if let Some(ts) = parse_timestamp(raw) {
                    *value = Value::Timestamp(ts);
                }
            }
        }
    }
}

/// On a full page, rows sharing the last change instant may continue past
/// the page boundary. They are dropped so the next run picks the whole group
/// up from a watermark strictly below it. A page made of a single instant
/// cannot be split that way and fails the run.
fn hold_back_boundary_ties(rows: &mut Vec<SourceRow>, change_column: &str, source: &str) -> Result<()> {
    let Some(last) = rows.last().and_then(|r| change_instant(r, change_column)) else {
        return Ok(());
    };
    let keep = rows
        .iter()
        .rposition(|r| change_instant(r, change_column) != Some(last))
        .map(|idx| idx + 1)
        .unwrap_or(0);

    if keep == 0 {
        warn!(
            source,
            change = %last.to_rfc3339(),
            rows = rows.len(),
            "Whole page shares one change instant"
        );
        return Err(Error::InvalidInput(format!(
            "Page of {} rows from {} all share {} = {}; raise pipeline.page_size",
            rows.len(),
            source,
            change_column,
            last.to_rfc3339()
        )));
    }
    rows.truncate(keep);
    Ok(())
}
