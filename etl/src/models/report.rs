use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The epoch instant used for sources that were never synced.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub source_name: String,
    pub value: DateTime<Utc>,
}

impl Watermark {
    pub fn new(source_name: &str, value: DateTime<Utc>) -> Self {
        Self {
            source_name: source_name.to_string(),
            value,
        }
    }

    pub fn epoch(source_name: &str) -> Self {
        Self::new(source_name, epoch())
    }

    pub fn is_epoch(&self) -> bool {
        self.value == epoch()
    }
}

/// Outcome of validating one batch. Valid exactly when no error was recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warning_rows: BTreeSet<usize>,
    pub null_counts: BTreeMap<String, usize>,
    pub duplicate_count: usize,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            "Validation failed".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Success,
    Partial,
    Failed,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Success => "success",
            LoadStatus::Partial => "partial",
            LoadStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(LoadStatus::Success),
            "partial" => Some(LoadStatus::Partial),
            "failed" => Some(LoadStatus::Failed),
            _ => None,
        }
    }

    /// Success and partial both mean data reached the destination.
    pub fn is_durable(&self) -> bool {
        !matches!(self, LoadStatus::Failed)
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub rows_written: usize,
    pub rows_skipped: usize,
    pub status: LoadStatus,
    pub error_msg: Option<String>,
    pub max_seen_timestamp: Option<DateTime<Utc>>,
}

impl LoadResult {
    /// A write that went through; partial when anything was held back.
    pub fn written(
        rows_written: usize,
        rows_skipped: usize,
        max_seen_timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        let status = if rows_skipped > 0 {
            LoadStatus::Partial
        } else {
            LoadStatus::Success
        };
        Self {
            rows_written,
            rows_skipped,
            status,
            error_msg: None,
            max_seen_timestamp,
        }
    }

    pub fn failed(rows_skipped: usize, error_msg: impl Into<String>) -> Self {
        Self {
            rows_written: 0,
            rows_skipped,
            status: LoadStatus::Failed,
            error_msg: Some(error_msg.into()),
            max_seen_timestamp: None,
        }
    }
}

/// One durable audit record per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionLogEntry {
    pub source: String,
    pub batch_id: String,
    pub row_count: usize,
    pub timestamp: DateTime<Utc>,
    pub status: LoadStatus,
    pub error_msg: Option<String>,
}

impl IngestionLogEntry {
    pub fn from_result(
        source: &str,
        batch_id: &str,
        timestamp: DateTime<Utc>,
        result: &LoadResult,
    ) -> Self {
        Self {
            source: source.to_string(),
            batch_id: batch_id.to_string(),
            row_count: result.rows_written,
            timestamp,
            status: result.status,
            error_msg: result.error_msg.clone(),
        }
    }

    /// Whether this entry proves rows actually landed for its source.
    pub fn shows_write(&self) -> bool {
        self.status.is_durable() && self.row_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_validity_follows_errors() {
        let mut report = ValidationReport::default();
        assert!(report.is_valid());
        report.errors.push("Missing required column: loan_id".into());
        assert!(!report.is_valid());
    }

    #[test]
    fn test_load_status_from_counts() {
        assert_eq!(LoadResult::written(10, 0, None).status, LoadStatus::Success);
        assert_eq!(LoadResult::written(8, 2, None).status, LoadStatus::Partial);

        let failed = LoadResult::failed(5, "duplicate key");
        assert_eq!(failed.status, LoadStatus::Failed);
        assert_eq!(failed.rows_written, 0);
        assert_eq!(failed.rows_skipped, 5);
    }

    #[test]
    fn test_epoch_watermark() {
        let wm = Watermark::epoch("loans");
        assert!(wm.is_epoch());
        assert_eq!(wm.value.to_rfc3339(), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_only_durable_entries_show_writes() {
        let now = Utc::now();
        let ok = IngestionLogEntry::from_result("loans", "b1", now, &LoadResult::written(3, 0, None));
        let empty = IngestionLogEntry::from_result("loans", "b2", now, &LoadResult::written(0, 0, None));
        let failed = IngestionLogEntry::from_result("loans", "b3", now, &LoadResult::failed(3, "x"));
        assert!(ok.shows_write());
        assert!(!empty.shows_write());
        assert!(!failed.shows_write());
    }
}
