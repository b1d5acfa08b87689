use super::{DownstreamEvent, EventPublisher, FailureNotice, FailureNotifier};
use async_trait::async_trait;
use common::{Error, Result};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use url::Url;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

struct WebhookClient {
    client: rquest::Client,
    url: Url,
}

impl WebhookClient {
    fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        let client = rquest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self { client, url })
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<()> {
        let payload = serde_json::to_vec(body)?;
        let response = self
            .client
            .post(self.url.as_str())
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Notification(format!(
                "Webhook {} responded with {}",
                self.url, status
            )));
        }
        Ok(())
    }
}

/// Posts `{"text": ...}` to a chat-style incoming webhook.
pub struct WebhookNotifier {
    inner: WebhookClient,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            inner: WebhookClient::new(url)?,
        })
    }
}

#[async_trait]
impl FailureNotifier for WebhookNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        self.inner.post(&json!({ "text": notice.message() })).await
    }
}

/// Posts the event as JSON to the downstream system's trigger endpoint.
pub struct WebhookPublisher {
    inner: WebhookClient,
}

impl WebhookPublisher {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            inner: WebhookClient::new(url)?,
        })
    }
}

#[async_trait]
impl EventPublisher for WebhookPublisher {
    async fn publish(&self, event: &DownstreamEvent) -> Result<()> {
        self.inner.post(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_malformed_url() {
        assert!(matches!(
            WebhookNotifier::new("not a url"),
            Err(Error::InvalidInput(_))
        ));
        assert!(WebhookPublisher::new("http://localhost:8080/trigger").is_ok());
    }
}
