//! Outbound signals emitted by pipeline runs: failure notices for operators
//! and downstream trigger events for the next processing stage.

mod channel;
mod log;
mod webhook;

pub use channel::{ChannelNotifier, ChannelPublisher};
pub use log::{LogNotifier, LogPublisher};
pub use webhook::{WebhookNotifier, WebhookPublisher};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Terminal failure of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNotice {
    pub pipeline_id: String,
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

impl FailureNotice {
    pub fn new(pipeline_id: &str, step_id: &str, error: impl ToString) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            step_id: step_id.to_string(),
            timestamp: Utc::now(),
            error: error.to_string(),
        }
    }

    pub fn message(&self) -> String {
        format!(
            "ETL failure detected\nPipeline: {}\nStep: {}\nTimestamp: {}\nError: {}",
            self.pipeline_id,
            self.step_id,
            self.timestamp.to_rfc3339(),
            self.error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub source_name: String,
}

/// "A new batch for `source_name` is available in the append-only store."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamEvent {
    pub target_pipeline_id: String,
    pub payload: TriggerPayload,
}

impl DownstreamEvent {
    pub fn new(target_pipeline_id: &str, source_name: &str) -> Self {
        Self {
            target_pipeline_id: target_pipeline_id.to_string(),
            payload: TriggerPayload {
                source_name: source_name.to_string(),
            },
        }
    }
}

#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify(&self, notice: &FailureNotice) -> Result<()>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DownstreamEvent) -> Result<()>;
}

/// Delivers a notice to every configured channel. One channel failing does
/// not stop the others.
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn FailureNotifier>>,
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<Arc<dyn FailureNotifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl FailureNotifier for FanoutNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(notice).await {
                warn!(
                    pipeline = %notice.pipeline_id,
                    error = %e,
                    "Failed to deliver failure notice"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl FailureNotifier for Broken {
        async fn notify(&self, _notice: &FailureNotice) -> Result<()> {
            Err(common::Error::Notification("webhook unreachable".into()))
        }
    }

    #[test]
    fn test_notice_message_names_pipeline_and_step() {
        let notice = FailureNotice::new("etl_loans_pg_to_bronze", "load", "disk full");
        let message = notice.message();
        assert!(message.contains("Pipeline: etl_loans_pg_to_bronze"));
        assert!(message.contains("Step: load"));
        assert!(message.contains("Error: disk full"));
    }

    #[test]
    fn test_event_wire_shape() {
        let event = DownstreamEvent::new("silver_loans_transform", "loans");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "target_pipeline_id": "silver_loans_transform",
                "payload": {"source_name": "loans"}
            })
        );
    }

    #[tokio::test]
    async fn test_fanout_survives_broken_channel() {
        let (channel, mut rx) = ChannelNotifier::new();
        let fanout = FanoutNotifier::new(vec![Arc::new(Broken), Arc::new(channel)]);

        let notice = FailureNotice::new("etl_calls_pg_to_bronze", "extract", "refused");
        fanout.notify(&notice).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.step_id, "extract");
    }
}
