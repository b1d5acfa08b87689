use super::{AppendSink, max_change, prepare_rows, record_failure};
use crate::models::{IngestionLogEntry, LoadResult, ValidationReport};
use crate::normalize::NormalizedBatch;
use crate::rules::SourceRules;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct AppendLoader {
    sink: Arc<dyn AppendSink>,
}

impl AppendLoader {
    pub fn new(sink: Arc<dyn AppendSink>) -> Self {
        Self { sink }
    }

    /// Audits a batch that was stopped before reaching the sink. Nothing is
    /// appended.
    pub async fn reject(
        &self,
        table: &str,
        batch_id: &str,
        loaded_at: DateTime<Utc>,
        rows: usize,
        reason: &str,
    ) -> LoadResult {
        let result = LoadResult::failed(rows, reason);
        record_failure(self.sink.as_ref(), table, batch_id, loaded_at, &result).await;
        result
    }

    /// Appends the batch to `table` with the full canonical schema. The audit
    /// entry is keyed by `table`.
    pub async fn load(
        &self,
        table: &str,
        rules: &SourceRules,
        batch: &NormalizedBatch,
        report: &ValidationReport,
        batch_id: &str,
        loaded_at: DateTime<Utc>,
    ) -> LoadResult {
        if !report.is_valid() {
            warn!(table, batch_id, "Refusing to append invalid batch");
            return self
                .reject(table, batch_id, loaded_at, batch.len(), &report.error_summary())
                .await;
        }

        let prepared = prepare_rows(batch, report, None);
        if prepared.rows.is_empty() {
            info!(table, batch_id, skipped = prepared.skipped, "Nothing to append");
            return LoadResult::written(0, prepared.skipped, None);
        }

        let result = LoadResult::written(
            prepared.rows.len(),
            prepared.skipped,
            max_change(&prepared.rows, rules.change_column.as_deref()),
        );
        let entry = IngestionLogEntry::from_result(table, batch_id, loaded_at, &result);

        match self
            .sink
            .append(table, &rules.columns, &prepared.rows, &entry)
            .await
        {
            Ok(key) => {
                info!(
                    table,
                    batch_id,
                    key = %key,
                    rows = result.rows_written,
                    max_seen = ?result.max_seen_timestamp,
                    "Appended batch"
                );
                result
            }
            Err(err) => {
                error!(table, batch_id, error = %err, "Append failed");
                let failed = LoadResult::failed(batch.len(), err.to_string());
                record_failure(self.sink.as_ref(), table, batch_id, loaded_at, &failed).await;
                failed
            }
        }
    }
}
