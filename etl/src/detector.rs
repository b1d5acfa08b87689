use crate::audit::IngestionLog;
use crate::extract::ChangeSource;
use crate::models::Watermark;
use crate::rules::PipelineDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Independent proof that a source changed after a point in time.
#[async_trait]
pub trait ChangeEvidence: Send + Sync {
    /// A description of the evidence, or `None` when the source looks untouched.
    async fn changes_since(
        &self,
        pipeline: &PipelineDefinition,
        since: DateTime<Utc>,
    ) -> Result<Option<String>>;
}

/// Writes recorded against the source in the relational ingestion log.
pub struct IngestionLogEvidence {
    log: Arc<dyn IngestionLog>,
}

impl IngestionLogEvidence {
    pub fn new(log: Arc<dyn IngestionLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl ChangeEvidence for IngestionLogEvidence {
    async fn changes_since(
        &self,
        pipeline: &PipelineDefinition,
        since: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let writes: Vec<_> = self
            .log
            .entries_since(&pipeline.source_name, since)
            .await?
            .into_iter()
            .filter(|entry| entry.shows_write())
            .collect();

        Ok(writes.last().map(|latest| {
            format!(
                "ingestion_log shows {} write(s) after it, latest batch {} with {} rows at {}",
                writes.len(),
                latest.batch_id,
                latest.row_count,
                latest.timestamp.to_rfc3339()
            )
        }))
    }
}

/// Counts rows in the source table past the watermark.
pub struct SourceTableEvidence {
    source: Arc<dyn ChangeSource>,
}

impl SourceTableEvidence {
    pub fn new(source: Arc<dyn ChangeSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ChangeEvidence for SourceTableEvidence {
    async fn changes_since(
        &self,
        pipeline: &PipelineDefinition,
        since: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let changed = self
            .source
            .count_changed_since(&pipeline.source_table, &pipeline.change_column, since)
            .await?;
        Ok((changed > 0).then(|| {
            format!(
                "{} has {} row(s) with {} after it",
                pipeline.source_table, changed, pipeline.change_column
            )
        }))
    }
}

pub struct SilentFailureDetector {
    evidence: Arc<dyn ChangeEvidence>,
}

impl SilentFailureDetector {
    pub fn new(evidence: Arc<dyn ChangeEvidence>) -> Self {
        Self { evidence }
    }

    /// Fails the run when nothing was extracted from a source that has a
    /// baseline and is known to have changed since it.
    pub async fn check(
        &self,
        pipeline: &PipelineDefinition,
        watermark: &Watermark,
        extracted_rows: usize,
    ) -> Result<()> {
        if extracted_rows > 0 || watermark.is_epoch() {
            return Ok(());
        }

        match self.evidence.changes_since(pipeline, watermark.value).await? {
            Some(evidence) => {
                warn!(
                    pipeline = %pipeline.pipeline_id,
                    source = %pipeline.source_name,
                    watermark = %watermark.value.to_rfc3339(),
                    evidence = %evidence,
                    "Zero rows extracted from a source that changed"
                );
                Err(Error::SilentFailure {
                    source_name: pipeline.source_name.clone(),
                    watermark: watermark.value.to_rfc3339(),
                    evidence,
                })
            }
            None => {
                info!(
                    source = %pipeline.source_name,
                    watermark = %watermark.value.to_rfc3339(),
                    "No new data since watermark"
                );
                Ok(())
            }
        }
    }
}
