//! CSV files into relational source tables: normalize, validate, upsert.

use crate::load::{RelationalSink, UpsertLoader};
use crate::models::{LoadResult, SourceRow, ValidationReport, Value};
use crate::normalize::{NormalizedBatch, normalize};
use crate::rules::{INGESTED_AT_COLUMN, SOURCE_FILE_COLUMN, SourceRules};
use crate::validate::{ReferenceLookup, Validator};
use chrono::{DateTime, Utc};
use common::Result;
use csv::{ReaderBuilder, Trim};
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct IngestionOutcome {
    pub batch_id: String,
    pub report: ValidationReport,
    pub result: LoadResult,
}

pub struct CsvIngestor {
    validator: Validator,
    loader: UpsertLoader,
}

/// Header plus rows, empty fields as nulls.
pub fn read_csv<R: Read>(input: R) -> Result<(Vec<String>, Vec<SourceRow>)> {
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(input);
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: SourceRow = header
            .iter()
            .zip(record.iter())
            .map(|(name, field)| {
                let value = if field.is_empty() {
                    Value::Null
                } else {
                    Value::text(field)
                };
                (name.clone(), value)
            })
            .collect();
        rows.push(row);
    }
    Ok((header, rows))
}

impl CsvIngestor {
    pub fn new(
        rules: SourceRules,
        lookup: Option<Arc<dyn ReferenceLookup>>,
        sink: Arc<dyn RelationalSink>,
    ) -> Self {
        let validator = match lookup {
            Some(lookup) => Validator::new(rules).with_lookup(lookup),
            None => Validator::new(rules),
        };
        Self {
            validator,
            loader: UpsertLoader::new(sink),
        }
    }

    pub fn rules(&self) -> &SourceRules {
        self.validator.rules()
    }

    pub async fn run(&self, path: &Path) -> Result<IngestionOutcome> {
        let file = std::fs::File::open(path)?;
        let (header, raw) = read_csv(file)?;
        let source_file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        info!(
            source = %self.rules().name,
            file = %source_file,
            rows = raw.len(),
            "Read CSV file"
        );
        self.ingest(&header, raw, &source_file, Utc::now()).await
    }

    /// Every row of one call shares `loaded_at` as its ingestion time, its
    /// change time and the audit entry time.
    pub async fn ingest(
        &self,
        header: &[String],
        raw: Vec<SourceRow>,
        source_file: &str,
        loaded_at: DateTime<Utc>,
    ) -> Result<IngestionOutcome> {
        let rules = self.rules();
        let mut batch = normalize(rules, header, raw);
        stamp_lineage(&mut batch, rules, source_file, loaded_at);

        let report = self.validator.validate(&batch).await;
        if !report.is_valid() {
            warn!(
                source = %rules.name,
                file = source_file,
                errors = %report.error_summary(),
                "CSV batch failed validation"
            );
        }

        let batch_id = Uuid::new_v4().to_string();
        let result = self
            .loader
            .load(rules, &batch, &report, &batch_id, loaded_at)
            .await;
        info!(
            source = %rules.name,
            batch_id = %batch_id,
            status = %result.status,
            written = result.rows_written,
            skipped = result.rows_skipped,
            "CSV ingestion finished"
        );
        Ok(IngestionOutcome {
            batch_id,
            report,
            result,
        })
    }
}

fn stamp_lineage(
    batch: &mut NormalizedBatch,
    rules: &SourceRules,
    source_file: &str,
    loaded_at: DateTime<Utc>,
) {
    let mut stamps = vec![
        (INGESTED_AT_COLUMN.to_string(), Value::Timestamp(loaded_at)),
        (SOURCE_FILE_COLUMN.to_string(), Value::text(source_file)),
    ];
    if let Some(change_column) = &rules.change_column {
        stamps.push((change_column.clone(), Value::Timestamp(loaded_at)));
    }

    for (column, value) in stamps {
        for row in batch.rows.iter_mut() {
            row.insert(column.clone(), value.clone());
        }
        if !batch.columns.contains(&column) {
            batch.columns.push(column.clone());
        }
        batch.present_columns.insert(column);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::IngestionLog;
    use crate::memory::MemoryDatabase;
    use crate::models::{LoadStatus, epoch};
    use crate::rules::SourceCatalog;
    use chrono::TimeZone;
    use std::io::Write;

    fn ingestor(source: &str, db: &Arc<MemoryDatabase>) -> CsvIngestor {
        let rules = SourceCatalog::builtin().source(source).unwrap().clone();
        CsvIngestor::new(rules, Some(db.clone()), db.clone())
    }

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn loans_csv(ids: &[String]) -> String {
        let mut csv =
            String::from("LoanID,BorrowerID,Amt,DisbursementDate,LoanStatus,PhoneNumber\n");
        for id in ids {
            csv.push_str(&format!("{},B-{},25000,2023-04-01,ACTIVE,9000000000\n", id, id));
        }
        csv
    }

    #[test]
    fn test_read_csv_turns_empty_fields_into_nulls() {
        let (header, rows) = read_csv("id, name ,phone\n1,  Asha ,\n".as_bytes()).unwrap();
        assert_eq!(header, vec!["id", "name", "phone"]);
        assert_eq!(rows[0]["name"], Value::text("Asha"));
        assert_eq!(rows[0]["phone"], Value::Null);
    }

    #[tokio::test]
    async fn test_loans_file_is_upserted_with_lineage() {
        let db = Arc::new(MemoryDatabase::new());
        let ids: Vec<String> = (1..=3).map(|i| format!("L{}", i)).collect();
        let file = write_file(&loans_csv(&ids));

        let outcome = ingestor("loans", &db).run(file.path()).await.unwrap();

        assert_eq!(outcome.result.status, LoadStatus::Success);
        assert_eq!(outcome.result.rows_written, 3);
        let row = db.find("loans", "loan_id", "L2").unwrap();
        assert_eq!(row["borrower_id"], Value::text("B-L2"));
        assert_eq!(row["principal_amount"], Value::Number(25000.0));
        let file_name = file.path().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(row[SOURCE_FILE_COLUMN], Value::text(file_name));
        assert_eq!(row[INGESTED_AT_COLUMN], row["updated_at"]);
        assert!(!row.contains_key("interest_rate"));

        let log = db.entries_since("loans", epoch()).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].batch_id, outcome.batch_id);
        assert_eq!(Some(log[0].timestamp), row["updated_at"].as_timestamp());
        assert_eq!(outcome.result.max_seen_timestamp, Some(log[0].timestamp));
    }

    #[tokio::test]
    async fn test_duplicate_loan_ids_fail_the_whole_file() {
        let db = Arc::new(MemoryDatabase::new());
        let mut ids: Vec<String> = (0..98).map(|i| format!("L{:03}", i)).collect();
        ids.push("L000".into());
        ids.push("L001".into());
        let file = write_file(&loans_csv(&ids));

        let outcome = ingestor("loans", &db).run(file.path()).await.unwrap();

        assert_eq!(outcome.report.duplicate_count, 2);
        assert!(!outcome.report.is_valid());
        assert!(
            outcome
                .report
                .errors
                .contains(&"Duplicate loan_id found at rows: [0, 1, 98, 99]".to_string())
        );
        assert_eq!(outcome.result.status, LoadStatus::Failed);
        assert_eq!(outcome.result.rows_written, 0);
        assert_eq!(db.row_count("loans"), 0);

        let log = db.entries_since("loans", epoch()).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, LoadStatus::Failed);
        assert_eq!(log[0].row_count, 0);
    }

    #[tokio::test]
    async fn test_payments_referencing_unknown_loans_are_rejected() {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_rows(
            "loans",
            vec![SourceRow::from([("loan_id".to_string(), Value::text("L1"))])],
        );
        let file = write_file(
            "PaymentID,LoanID,Amount,PaymentDate,PaymentStatus\n\
             P1,L1,500,2024-01-05,SUCCESS\n\
             P2,L9,700,2024-01-06,SUCCESS\n",
        );

        let outcome = ingestor("payments", &db).run(file.path()).await.unwrap();

        assert_eq!(
            outcome.report.errors,
            vec!["loan_id does not exist in loans table at rows: [1]".to_string()]
        );
        assert_eq!(db.row_count("payments"), 0);
    }

    #[tokio::test]
    async fn test_reingesting_the_same_file_is_idempotent() {
        let db = Arc::new(MemoryDatabase::new());
        let ingestor = ingestor("crm", &db);
        let (header, rows) =
            read_csv("CustomerID,Name,PhoneNumber\nC1,Asha,98\nC2,Ravi,99\n".as_bytes()).unwrap();
        let first = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap();

        ingestor.ingest(&header, rows.clone(), "crm.csv", first).await.unwrap();
        ingestor.ingest(&header, rows, "crm.csv", second).await.unwrap();

        assert_eq!(db.row_count("crm"), 2);
        let row = db.find("crm", "customer_id", "C1").unwrap();
        assert_eq!(row["updated_at"], Value::Timestamp(second));
        assert_eq!(db.entries_since("crm", epoch()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_optional_phone_skips_row() {
        let db = Arc::new(MemoryDatabase::new());
        let (header, rows) =
            read_csv("CustomerID,Name,PhoneNumber\nC1,Asha,98\nC2,Ravi,\n".as_bytes()).unwrap();

        let outcome = ingestor("crm", &db)
            .ingest(&header, rows, "crm.csv", Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome.result.status, LoadStatus::Partial);
        assert_eq!(outcome.result.rows_written, 1);
        assert_eq!(outcome.result.rows_skipped, 1);
        assert!(db.find("crm", "customer_id", "C2").is_none());
    }
}
