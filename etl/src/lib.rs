pub mod audit;
pub mod detector;
pub mod extract;
pub mod ingestion;
pub mod load;
pub mod memory;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod postgres;
pub mod rules;
pub mod storage;
pub mod utils;
pub mod validate;
pub mod watermark;

use common::config::{EvidenceKind, Settings};
use common::{Error, Result};
use detector::{ChangeEvidence, IngestionLogEvidence, SourceTableEvidence};
use futures::future::join_all;
use ingestion::{CsvIngestor, IngestionOutcome};
use notification::{
    EventPublisher, FailureNotifier, FanoutNotifier, LogNotifier, LogPublisher, WebhookNotifier,
    WebhookPublisher,
};
use pipeline::{Pipeline, PipelineResources, RunDriver};
use postgres::PgStore;
use rules::{PipelineDefinition, SourceCatalog};
use std::path::Path;
use std::sync::Arc;
use storage::ObjectStoreStorage;
use storage::bronze::BronzeWriter;
use tracing::{error, info};

pub fn load_catalog(settings: &Settings) -> Result<SourceCatalog> {
    match &settings.sources_file {
        Some(path) => SourceCatalog::with_file(path),
        None => Ok(SourceCatalog::builtin()),
    }
}

/// Log channel always, webhook too when configured.
pub fn failure_notifier(settings: &Settings) -> Result<Arc<dyn FailureNotifier>> {
    let mut notifiers: Vec<Arc<dyn FailureNotifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &settings.notification.failure_webhook_url {
        notifiers.push(Arc::new(WebhookNotifier::new(url)?));
    }
    Ok(Arc::new(FanoutNotifier::new(notifiers)))
}

pub fn downstream_publisher(settings: &Settings) -> Result<Arc<dyn EventPublisher>> {
    Ok(match &settings.notification.downstream_webhook_url {
        Some(url) => Arc::new(WebhookPublisher::new(url)?),
        None => Arc::new(LogPublisher),
    })
}

/// Long-lived backends for one process.
pub struct Services {
    pub settings: Settings,
    pub catalog: SourceCatalog,
    pub store: Arc<PgStore>,
    pub storage: Arc<ObjectStoreStorage>,
}

impl Services {
    pub async fn connect(settings: Settings) -> Result<Self> {
        let catalog = load_catalog(&settings)?;
        let store = Arc::new(PgStore::connect(&settings.database).await?);
        let storage = Arc::new(ObjectStoreStorage::from_config(&settings.storage)?);
        Ok(Self {
            settings,
            catalog,
            store,
            storage,
        })
    }

    pub fn resources(&self) -> Result<PipelineResources> {
        let evidence: Arc<dyn ChangeEvidence> = match self.settings.pipeline.evidence {
            EvidenceKind::IngestionLog => Arc::new(IngestionLogEvidence::new(self.store.clone())),
            EvidenceKind::SourceTable => Arc::new(SourceTableEvidence::new(self.store.clone())),
        };
        Ok(PipelineResources {
            source: self.store.clone(),
            watermarks: self.store.clone(),
            evidence,
            bronze: Arc::new(BronzeWriter::new(self.storage.clone())),
            publisher: downstream_publisher(&self.settings)?,
            page_size: self.settings.pipeline.page_size,
        })
    }

    pub fn driver(&self) -> Result<RunDriver> {
        Ok(RunDriver::new(
            self.settings.pipeline.max_retries,
            self.settings.pipeline.retry_delay_ms,
            failure_notifier(&self.settings)?,
        ))
    }

    fn build_pipeline(
        &self,
        definition: &PipelineDefinition,
        resources: &PipelineResources,
    ) -> Pipeline {
        Pipeline::new(
            definition.clone(),
            self.catalog.extract_rules(definition),
            resources,
        )
    }
}

/// Creates the bookkeeping tables and any missing source table.
pub async fn init_database(settings: Settings) -> Result<()> {
    let services = Services::connect(settings).await?;
    let sources = services
        .catalog
        .source_names()
        .map(|name| services.catalog.source(name))
        .collect::<Result<Vec<_>>>()?;
    services.store.ensure_schema(sources).await?;
    info!("Database schema is ready");
    Ok(())
}

pub async fn run_ingestion(settings: Settings, source: &str, file: &Path) -> Result<IngestionOutcome> {
    let services = Services::connect(settings).await?;
    let rules = services.catalog.source(source)?.clone();
    let ingestor = CsvIngestor::new(rules, Some(services.store.clone()), services.store.clone());
    ingestor.run(file).await
}

pub async fn run_pipeline(settings: Settings, pipeline_id: &str) -> Result<()> {
    let services = Services::connect(settings).await?;
    let definition = services.catalog.pipeline(pipeline_id)?;
    let pipeline = services.build_pipeline(definition, &services.resources()?);

    services
        .driver()?
        .run(&pipeline)
        .await
        .map(|_| ())
        .map_err(|failure| failure.error)
}

/// Runs every configured pipeline concurrently. Pipelines are independent,
/// one failing leaves the others running.
pub async fn run_all_pipelines(settings: Settings) -> Result<()> {
    let services = Services::connect(settings).await?;
    let resources = services.resources()?;
    let driver = services.driver()?;
    let pipelines: Vec<Pipeline> = services
        .catalog
        .pipelines()
        .map(|definition| services.build_pipeline(definition, &resources))
        .collect();

    let outcomes = join_all(pipelines.iter().map(|pipeline| driver.run(pipeline))).await;
    let failed: Vec<String> = outcomes
        .into_iter()
        .filter_map(|outcome| outcome.err())
        .map(|failure| failure.pipeline_id)
        .collect();

    info!(
        total = pipelines.len(),
        failed = failed.len(),
        "Finished all pipelines"
    );
    if failed.is_empty() {
        Ok(())
    } else {
        error!(pipelines = ?failed, "Some pipelines failed");
        Err(Error::Other(format!("Pipelines failed: {}", failed.join(", "))))
    }
}
