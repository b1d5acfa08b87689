use super::{DownstreamEvent, EventPublisher, FailureNotice, FailureNotifier};
use async_trait::async_trait;
use common::Result;
use tracing::{error, info};

pub struct LogNotifier;

#[async_trait]
impl FailureNotifier for LogNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        error!(
            pipeline = %notice.pipeline_id,
            step = %notice.step_id,
            timestamp = %notice.timestamp.to_rfc3339(),
            error = %notice.error,
            "ETL failure detected"
        );
        Ok(())
    }
}

pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &DownstreamEvent) -> Result<()> {
        info!(
            target_pipeline = %event.target_pipeline_id,
            source = %event.payload.source_name,
            "Downstream trigger emitted"
        );
        Ok(())
    }
}
