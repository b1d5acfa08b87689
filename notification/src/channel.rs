use super::{DownstreamEvent, EventPublisher, FailureNotice, FailureNotifier};
use async_trait::async_trait;
use common::{Error, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// In-process event bus. The receiving half belongs to whatever consumes
/// the trigger (a local transform worker, or a test).
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: UnboundedSender<DownstreamEvent>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, UnboundedReceiver<DownstreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: &DownstreamEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| Error::Notification("Downstream receiver dropped".into()))
    }
}

#[derive(Clone)]
pub struct ChannelNotifier {
    tx: UnboundedSender<FailureNotice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, UnboundedReceiver<FailureNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FailureNotifier for ChannelNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        self.tx
            .send(notice.clone())
            .map_err(|_| Error::Notification("Failure receiver dropped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_after_receiver_dropped_is_an_error() {
        let (publisher, rx) = ChannelPublisher::new();
        drop(rx);

        let result = publisher
            .publish(&DownstreamEvent::new("silver_crm_transform", "crm"))
            .await;
        assert!(matches!(result, Err(Error::Notification(_))));
    }
}
