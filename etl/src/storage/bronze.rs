use super::ObjectStorage;
use crate::audit::{IngestionLog, ObjectStoreIngestionLog};
use crate::load::AppendSink;
use crate::models::{IngestionLogEntry, SourceRow, Value};
use crate::rules::{ColumnSpec, ColumnType};
use arrow::array::{ArrayRef, Float64Builder, StringBuilder, TimestampMicrosecondBuilder};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Result;
use parquet::arrow::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use std::sync::Arc;
use tracing::debug;

pub const LOAD_TIMESTAMP_COLUMN: &str = "_load_timestamp";
pub const AUDIT_METADATA_KEY: &str = "ingestion_log_entry";

/// Writes one Parquet object per batch under
/// `<table>/load_date=<date>/<batch_id>.parquet` and records the batch in the
/// object-store ingestion log.
pub struct BronzeWriter {
    storage: Arc<dyn ObjectStorage>,
    log: ObjectStoreIngestionLog,
}

impl BronzeWriter {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            log: ObjectStoreIngestionLog::new(storage.clone()),
            storage,
        }
    }

    fn object_key(table: &str, batch_id: &str, loaded_at: DateTime<Utc>) -> String {
        format!(
            "{}/load_date={}/{}.parquet",
            table,
            loaded_at.format("%Y-%m-%d"),
            batch_id
        )
    }
}

fn utc_timestamp() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

fn arrow_type(kind: ColumnType) -> DataType {
    match kind {
        ColumnType::Text => DataType::Utf8,
        ColumnType::Float => DataType::Float64,
        ColumnType::Timestamp => utc_timestamp(),
    }
}

fn build_column(spec: &ColumnSpec, rows: &[SourceRow]) -> ArrayRef {
    let cells = rows.iter().map(|row| row.get(&spec.name).unwrap_or(&Value::Null));
    match spec.kind {
        ColumnType::Text => {
            let mut builder = StringBuilder::new();
            for cell in cells {
                builder.append_option(cell.to_key());
            }
            Arc::new(builder.finish())
        }
        ColumnType::Float => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for cell in cells {
                builder.append_option(cell.as_f64());
            }
            Arc::new(builder.finish())
        }
        ColumnType::Timestamp => {
            let mut builder = TimestampMicrosecondBuilder::with_capacity(rows.len()).with_timezone("UTC");
            for cell in cells {
                builder.append_option(cell.as_timestamp().map(|ts| ts.timestamp_micros()));
            }
            Arc::new(builder.finish())
        }
    }
}

/// Canonical columns plus `_load_timestamp`.
pub fn to_record_batch(
    columns: &[ColumnSpec],
    rows: &[SourceRow],
    loaded_at: DateTime<Utc>,
) -> Result<RecordBatch> {
    let mut fields: Vec<Field> = columns
        .iter()
        .map(|spec| Field::new(spec.name.as_str(), arrow_type(spec.kind), true))
        .collect();
    fields.push(Field::new(LOAD_TIMESTAMP_COLUMN, utc_timestamp(), false));

    let mut arrays: Vec<ArrayRef> = columns.iter().map(|spec| build_column(spec, rows)).collect();
    let mut load_ts = TimestampMicrosecondBuilder::with_capacity(rows.len()).with_timezone("UTC");
    for _ in rows {
        load_ts.append_value(loaded_at.timestamp_micros());
    }
    arrays.push(Arc::new(load_ts.finish()));

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

#[async_trait]
impl AppendSink for BronzeWriter {
    async fn append(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        rows: &[SourceRow],
        entry: &IngestionLogEntry,
    ) -> Result<String> {
        let batch = to_record_batch(columns, rows, entry.timestamp)?;
        let props = WriterProperties::builder()
            .set_key_value_metadata(Some(vec![KeyValue::new(
                AUDIT_METADATA_KEY.to_string(),
                Some(serde_json::to_string(entry)?),
            )]))
            .build();

        let mut buffer: Vec<u8> = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;

        let key = Self::object_key(table, &entry.batch_id, entry.timestamp);
        self.storage.put_object(&key, &buffer).await?;
        debug!(bucket = self.storage.bucket(), key = %key, bytes = buffer.len(), "Wrote bronze object");

        self.log.record(entry).await?;
        Ok(key)
    }
}

#[async_trait]
impl IngestionLog for BronzeWriter {
    async fn record(&self, entry: &IngestionLogEntry) -> Result<()> {
        self.log.record(entry).await
    }

    async fn entries_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IngestionLogEntry>> {
        self.log.entries_since(source, since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::AppendLoader;
    use crate::models::{LoadStatus, ValidationReport, epoch};
    use crate::normalize::{header_of, normalize};
    use crate::rules::SourceCatalog;
    use crate::storage::ObjectStoreStorage;
    use arrow::array::{Array, Float64Array, StringArray};
    use bytes::Bytes;
    use chrono::TimeZone;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::collections::BTreeSet;

    fn loans() -> Vec<SourceRow> {
        [("L1", "2024-01-02T00:00:00Z"), ("L2", "2024-01-03T00:00:00Z")]
            .iter()
            .map(|(id, ts)| {
                SourceRow::from([
                    ("loan_id".to_string(), Value::text(*id)),
                    ("principal_amount".to_string(), Value::Number(1500.0)),
                    ("updated_at".to_string(), Value::text(*ts)),
                ])
            })
            .collect()
    }

    #[tokio::test]
    async fn test_append_writes_parquet_with_audit_metadata() {
        let storage = Arc::new(ObjectStoreStorage::in_memory("bronze"));
        let writer = Arc::new(BronzeWriter::new(storage.clone()));
        let catalog = SourceCatalog::builtin();
        let rules = catalog.extract_rules(catalog.pipeline("etl_loans_pg_to_bronze").unwrap());
        let raw = loans();
        let batch = normalize(&rules, &header_of(&raw), raw);
        let loaded_at = Utc.with_ymd_and_hms(2024, 1, 4, 8, 0, 0).unwrap();

        let result = AppendLoader::new(writer.clone())
            .load("loans_raw", &rules, &batch, &ValidationReport::default(), "batch-1", loaded_at)
            .await;

        assert_eq!(result.status, LoadStatus::Success);
        assert_eq!(result.rows_written, 2);
        assert_eq!(
            result.max_seen_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap())
        );

        let data = storage
            .get_object("loans_raw/load_date=2024-01-04/batch-1.parquet")
            .await
            .unwrap()
            .unwrap();
        let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(data)).unwrap();
        let audit = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .and_then(|kv| kv.iter().find(|kv| kv.key == AUDIT_METADATA_KEY))
            .and_then(|kv| kv.value.clone())
            .unwrap();
        let entry: IngestionLogEntry = serde_json::from_str(&audit).unwrap();
        assert_eq!(entry.row_count, 2);
        assert_eq!(entry.source, "loans_raw");

        let batches: Vec<RecordBatch> = builder.build().unwrap().map(|b| b.unwrap()).collect();
        let schema = batches[0].schema();
        assert!(schema.field_with_name(LOAD_TIMESTAMP_COLUMN).is_ok());
        assert!(schema.field_with_name("borrower_id").is_ok());
        let ids = batches[0]
            .column_by_name("loan_id")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(ids.value(0), "L1");
        let amounts = batches[0]
            .column_by_name("principal_amount")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(amounts.value(1), 1500.0);
        assert!(batches[0].column_by_name("borrower_id").unwrap().is_null(0));

        let logged = writer.entries_since("loans_raw", epoch()).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].batch_id, "batch-1");
    }

    #[tokio::test]
    async fn test_invalid_batch_is_not_appended() {
        let storage = Arc::new(ObjectStoreStorage::in_memory("bronze"));
        let writer = Arc::new(BronzeWriter::new(storage.clone()));
        let catalog = SourceCatalog::builtin();
        let rules = catalog.extract_rules(catalog.pipeline("etl_loans_pg_to_bronze").unwrap());
        let raw = loans();
        let batch = normalize(&rules, &header_of(&raw), raw);
        let report = ValidationReport {
            errors: vec!["Missing required column: borrower_id".into()],
            warning_rows: BTreeSet::new(),
            ..Default::default()
        };

        let result = AppendLoader::new(writer.clone())
            .load("loans_raw", &rules, &batch, &report, "batch-2", Utc::now())
            .await;

        assert_eq!(result.status, LoadStatus::Failed);
        assert!(storage.list_objects("loans_raw").await.unwrap().is_empty());
        let logged = writer.entries_since("loans_raw", epoch()).await.unwrap();
        assert_eq!(logged[0].status, LoadStatus::Failed);
    }
}
