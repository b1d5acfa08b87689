use super::{RelationalSink, max_change, prepare_rows, record_failure};
use crate::models::{IngestionLogEntry, LoadResult, ValidationReport};
use crate::normalize::NormalizedBatch;
use crate::rules::SourceRules;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct UpsertLoader {
    sink: Arc<dyn RelationalSink>,
}

impl UpsertLoader {
    pub fn new(sink: Arc<dyn RelationalSink>) -> Self {
        Self { sink }
    }

    /// Writes only the columns the input carried. Never writes anything for
    /// an invalid report.
    pub async fn load(
        &self,
        rules: &SourceRules,
        batch: &NormalizedBatch,
        report: &ValidationReport,
        batch_id: &str,
        loaded_at: DateTime<Utc>,
    ) -> LoadResult {
        let source = rules.name.as_str();
        if !report.is_valid() {
            let result = LoadResult::failed(batch.len(), report.error_summary());
            warn!(source, batch_id, errors = report.errors.len(), "Refusing to load invalid batch");
            record_failure(self.sink.as_ref(), source, batch_id, loaded_at, &result).await;
            return result;
        }

        let columns: Vec<String> = batch
            .columns
            .iter()
            .filter(|c| batch.is_present(c))
            .cloned()
            .collect();
        let key_column = match rules.primary_key() {
            Some(key) if columns.contains(&key) => key,
            Some(key) => {
                let result =
                    LoadResult::failed(batch.len(), format!("Primary key column {} is missing", key));
                record_failure(self.sink.as_ref(), source, batch_id, loaded_at, &result).await;
                return result;
            }
            None => {
                let result = LoadResult::failed(batch.len(), "No columns to load");
                record_failure(self.sink.as_ref(), source, batch_id, loaded_at, &result).await;
                return result;
            }
        };

        let prepared = prepare_rows(batch, report, Some(&key_column));
        let result = LoadResult::written(
            prepared.rows.len(),
            prepared.skipped,
            max_change(&prepared.rows, rules.change_column.as_deref()),
        );
        let entry = IngestionLogEntry::from_result(source, batch_id, loaded_at, &result);

        match self
            .sink
            .upsert_with_log(rules.table(), &key_column, &columns, &prepared.rows, &entry)
            .await
        {
            Ok(written) => {
                info!(
                    source,
                    table = rules.table(),
                    batch_id,
                    rows = written,
                    skipped = result.rows_skipped,
                    status = %result.status,
                    "Upsert load complete"
                );
                result
            }
            Err(err) => {
                error!(source, batch_id, error = %err, "Upsert load rolled back");
                let failed = LoadResult::failed(batch.len(), err.to_string());
                record_failure(self.sink.as_ref(), source, batch_id, loaded_at, &failed).await;
                failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::IngestionLog;
    use crate::memory::MemoryDatabase;
    use crate::models::{LoadStatus, SourceRow, Value, epoch};
    use crate::normalize::{header_of, normalize};
    use crate::rules::{ColumnSpec, ColumnType, SourceCatalog, SourceRules};
    use crate::validate::Validator;
    use chrono::TimeZone;

    fn crm_rows() -> Vec<SourceRow> {
        ["C1", "C2", "C3"]
            .iter()
            .map(|id| {
                SourceRow::from([
                    ("customer_id".to_string(), Value::text(*id)),
                    ("name".to_string(), Value::text(format!("Customer {}", id))),
                    ("phone_number".to_string(), Value::text("9990001111")),
                    ("email".to_string(), Value::text("c@example.com")),
                ])
            })
            .collect()
    }

    async fn run(db: &Arc<MemoryDatabase>, raw: Vec<SourceRow>, batch_id: &str) -> LoadResult {
        let catalog = SourceCatalog::builtin();
        let rules = catalog.source("crm").unwrap();
        let batch = normalize(rules, &header_of(&raw), raw);
        let report = Validator::new(rules.clone()).validate(&batch).await;
        let loaded_at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        UpsertLoader::new(db.clone())
            .load(rules, &batch, &report, batch_id, loaded_at)
            .await
    }

    #[tokio::test]
    async fn test_reloading_same_rows_is_idempotent() {
        let db = Arc::new(MemoryDatabase::new());

        let first = run(&db, crm_rows(), "b1").await;
        let second = run(&db, crm_rows(), "b2").await;

        assert_eq!(first.status, LoadStatus::Success);
        assert_eq!(second.status, LoadStatus::Success);
        assert_eq!(db.row_count("crm"), 3);
        assert_eq!(db.entries_since("crm", epoch()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_replaces_non_key_columns() {
        let db = Arc::new(MemoryDatabase::new());
        run(&db, crm_rows(), "b1").await;

        let mut changed = crm_rows();
        changed[0].insert("name".into(), Value::text("Renamed"));
        run(&db, changed, "b2").await;

        let row = db.find("crm", "customer_id", "C1").unwrap();
        assert_eq!(row["name"], Value::text("Renamed"));
        assert_eq!(db.row_count("crm"), 3);
    }

    #[tokio::test]
    async fn test_warning_rows_skipped_as_partial() {
        let db = Arc::new(MemoryDatabase::new());
        let mut rows = crm_rows();
        rows[2].insert("email".into(), Value::Null);

        let result = run(&db, rows, "b1").await;
        assert_eq!(result.status, LoadStatus::Partial);
        assert_eq!(result.rows_written, 2);
        assert_eq!(result.rows_skipped, 1);
        assert_eq!(db.row_count("crm"), 2);
    }

    #[tokio::test]
    async fn test_invalid_report_writes_nothing() {
        let db = Arc::new(MemoryDatabase::new());
        let mut rows = crm_rows();
        rows[1].insert("customer_id".into(), Value::text("C1"));

        let result = run(&db, rows, "b1").await;
        assert_eq!(result.status, LoadStatus::Failed);
        assert_eq!(result.rows_written, 0);
        assert_eq!(db.row_count("crm"), 0);

        let entries = db.entries_since("crm", epoch()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, LoadStatus::Failed);
        assert!(entries[0].error_msg.as_deref().unwrap().contains("Duplicate customer_id"));
    }

    #[tokio::test]
    async fn test_write_error_rolls_back_and_keeps_text() {
        let db = Arc::new(MemoryDatabase::new());
        db.fail_writes("deadlock detected");

        let result = run(&db, crm_rows(), "b1").await;
        assert_eq!(result.status, LoadStatus::Failed);
        assert!(result.error_msg.as_deref().unwrap().contains("deadlock detected"));
        assert_eq!(db.row_count("crm"), 0);

        let entries = db.entries_since("crm", epoch()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, LoadStatus::Failed);
    }

    #[tokio::test]
    async fn test_conflict_key_comes_from_declared_schema() {
        let db = Arc::new(MemoryDatabase::new());
        let mut rules = SourceRules::new(
            "notes",
            vec![
                ColumnSpec::new("note_id", ColumnType::Text),
                ColumnSpec::new("body", ColumnType::Text),
            ],
        );
        rules.change_column = None;
        let raw = vec![SourceRow::from([("body".to_string(), Value::text("hello"))])];
        let batch = normalize(&rules, &header_of(&raw), raw);
        let report = Validator::new(rules.clone()).validate(&batch).await;
        assert!(report.is_valid());

        let loaded_at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let result = UpsertLoader::new(db.clone())
            .load(&rules, &batch, &report, "b1", loaded_at)
            .await;

        assert_eq!(result.status, LoadStatus::Failed);
        assert_eq!(result.error_msg.as_deref(), Some("Primary key column note_id is missing"));
        assert_eq!(db.row_count("notes"), 0);
    }
}
