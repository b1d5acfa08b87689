use crate::models::IngestionLogEntry;
use crate::storage::ObjectStorage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// Append-only audit trail of load attempts.
#[async_trait]
pub trait IngestionLog: Send + Sync {
    async fn record(&self, entry: &IngestionLogEntry) -> Result<()>;

    /// Entries for `source` with a timestamp strictly after `since`, oldest first.
    async fn entries_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IngestionLogEntry>>;
}

/// Stores each entry as its own JSON object at
/// `ingestion_log/<source>/<micros>_<batch_id>.json`.
pub struct ObjectStoreIngestionLog {
    storage: Arc<dyn ObjectStorage>,
}

impl ObjectStoreIngestionLog {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    pub(crate) fn entry_key(entry: &IngestionLogEntry) -> String {
        format!(
            "ingestion_log/{}/{:020}_{}.json",
            entry.source,
            entry.timestamp.timestamp_micros().max(0),
            entry.batch_id
        )
    }
}

#[async_trait]
impl IngestionLog for ObjectStoreIngestionLog {
    async fn record(&self, entry: &IngestionLogEntry) -> Result<()> {
        let body = serde_json::to_vec_pretty(entry)?;
        self.storage.put_object(&Self::entry_key(entry), &body).await?;
        debug!(
            source = %entry.source,
            batch_id = %entry.batch_id,
            status = %entry.status,
            rows = entry.row_count,
            "Recorded ingestion log entry"
        );
        Ok(())
    }

    async fn entries_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IngestionLogEntry>> {
        let keys = self
            .storage
            .list_objects(&format!("ingestion_log/{}", source))
            .await?;

        let mut entries = Vec::new();
        for key in keys {
            let Some(data) = self.storage.get_object(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<IngestionLogEntry>(&data) {
                Ok(entry) if entry.timestamp > since => entries.push(entry),
                Ok(_) => {}
                Err(err) => warn!(key = %key, error = %err, "Skipping unreadable log entry"),
            }
        }
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LoadResult;
    use crate::storage::ObjectStoreStorage;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_entries_since_filters_by_source_and_time() {
        let log = ObjectStoreIngestionLog::new(Arc::new(ObjectStoreStorage::in_memory("bronze")));
        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();
        let ok = LoadResult::written(5, 0, None);

        for (source, batch, ts) in [
            ("loans_raw", "b1", day(1)),
            ("loans_raw", "b2", day(3)),
            ("loans_raw", "b3", day(2)),
            ("calls_raw", "b4", day(5)),
        ] {
            log.record(&IngestionLogEntry::from_result(source, batch, ts, &ok))
                .await
                .unwrap();
        }

        let entries = log.entries_since("loans_raw", day(1)).await.unwrap();
        let batches: Vec<&str> = entries.iter().map(|e| e.batch_id.as_str()).collect();
        assert_eq!(batches, vec!["b3", "b2"]);
        assert!(log.entries_since("tts", day(1)).await.unwrap().is_empty());
    }
}
