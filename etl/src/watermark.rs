use crate::models::Watermark;
use crate::storage::ObjectStorage;
use async_trait::async_trait;
use common::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Durable "last processed change timestamp" per source. Reads never fail on
/// a missing or malformed value; both mean the source was never synced.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, source_name: &str) -> Result<Watermark>;
    async fn set(&self, watermark: &Watermark) -> Result<()>;
}

/// One JSON document per source under `watermarks/`.
pub struct ObjectStoreWatermarkStore {
    storage: Arc<dyn ObjectStorage>,
}

impl ObjectStoreWatermarkStore {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    fn key(source_name: &str) -> String {
        format!("watermarks/{}.json", source_name)
    }
}

#[async_trait]
impl WatermarkStore for ObjectStoreWatermarkStore {
    async fn get(&self, source_name: &str) -> Result<Watermark> {
        let key = Self::key(source_name);
        let Some(data) = self.storage.get_object(&key).await? else {
            info!(source = source_name, "No watermark stored, starting from epoch");
            return Ok(Watermark::epoch(source_name));
        };

        match serde_json::from_slice::<Watermark>(&data) {
            Ok(watermark) => {
                debug!(source = source_name, watermark = %watermark.value, "Read watermark");
                Ok(Watermark::new(source_name, watermark.value))
            }
            Err(err) => {
                warn!(
                    source = source_name,
                    key = %key,
                    error = %err,
                    "Unparsable watermark, treating source as never synced"
                );
                Ok(Watermark::epoch(source_name))
            }
        }
    }

    async fn set(&self, watermark: &Watermark) -> Result<()> {
        let body = serde_json::to_vec_pretty(watermark)?;
        self.storage
            .put_object(&Self::key(&watermark.source_name), &body)
            .await?;
        info!(
            source = %watermark.source_name,
            watermark = %watermark.value.to_rfc3339(),
            "Watermark updated"
        );
        Ok(())
    }
}
