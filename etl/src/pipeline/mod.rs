//! Incremental extract-validate-load run for one source:
//! `GetWatermark -> Extract -> Validate -> Load -> AdvanceWatermark -> TriggerDownstream`.

mod runner;

pub use runner::RunDriver;

use crate::detector::{ChangeEvidence, SilentFailureDetector};
use crate::extract::{ChangeExtractor, ChangeSource, ExtractedBatch};
use crate::load::{AppendLoader, AppendSink};
use crate::models::{LoadResult, ValidationReport, Watermark};
use crate::normalize::{NormalizedBatch, header_of, normalize};
use crate::rules::{PipelineDefinition, SourceRules};
use crate::validate::Validator;
use crate::watermark::WatermarkStore;
use chrono::{DateTime, Utc};
use common::{Error, Result};
use notification::{DownstreamEvent, EventPublisher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    GetWatermark,
    Extract,
    Validate,
    Load,
    AdvanceWatermark,
    TriggerDownstream,
}

impl StepId {
    pub const ALL: [StepId; 6] = [
        StepId::GetWatermark,
        StepId::Extract,
        StepId::Validate,
        StepId::Load,
        StepId::AdvanceWatermark,
        StepId::TriggerDownstream,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::GetWatermark => "get_watermark",
            StepId::Extract => "extract",
            StepId::Validate => "validate",
            StepId::Load => "load",
            StepId::AdvanceWatermark => "advance_watermark",
            StepId::TriggerDownstream => "trigger_downstream",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedBatch {
    pub batch: NormalizedBatch,
    pub report: ValidationReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "output", rename_all = "snake_case")]
pub enum StepOutput {
    Watermark(Watermark),
    Extracted(ExtractedBatch),
    Validated(ValidatedBatch),
    Loaded(LoadResult),
    /// `None` when the watermark was left alone.
    WatermarkAdvanced(Option<Watermark>),
    /// `None` when nothing was triggered.
    Triggered(Option<DownstreamEvent>),
}

/// State handed from step to step. Serializable so a scheduler can persist it
/// between step invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub pipeline_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    outputs: BTreeMap<StepId, StepOutput>,
}

impl RunContext {
    pub fn new(pipeline_id: &str) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, step: StepId, output: StepOutput) {
        self.outputs.insert(step, output);
    }

    pub fn output(&self, step: StepId) -> Option<&StepOutput> {
        self.outputs.get(&step)
    }

    fn missing(step: StepId) -> Error {
        Error::Other(format!("Step {} has not produced its output yet", step))
    }

    pub fn watermark(&self) -> Result<&Watermark> {
        match self.output(StepId::GetWatermark) {
            Some(StepOutput::Watermark(wm)) => Ok(wm),
            _ => Err(Self::missing(StepId::GetWatermark)),
        }
    }

    pub fn extracted(&self) -> Result<&ExtractedBatch> {
        match self.output(StepId::Extract) {
            Some(StepOutput::Extracted(batch)) => Ok(batch),
            _ => Err(Self::missing(StepId::Extract)),
        }
    }

    pub fn validated(&self) -> Result<&ValidatedBatch> {
        match self.output(StepId::Validate) {
            Some(StepOutput::Validated(batch)) => Ok(batch),
            _ => Err(Self::missing(StepId::Validate)),
        }
    }

    pub fn loaded(&self) -> Result<&LoadResult> {
        match self.output(StepId::Load) {
            Some(StepOutput::Loaded(result)) => Ok(result),
            _ => Err(Self::missing(StepId::Load)),
        }
    }

    pub fn advanced_watermark(&self) -> Option<&Watermark> {
        match self.output(StepId::AdvanceWatermark) {
            Some(StepOutput::WatermarkAdvanced(wm)) => wm.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Pipeline {pipeline_id} failed at step {step}: {error}")]
pub struct StepFailure {
    pub pipeline_id: String,
    pub step: StepId,
    #[source]
    pub error: Error,
}

/// Shared backends injected into every pipeline.
#[derive(Clone)]
pub struct PipelineResources {
    pub source: Arc<dyn ChangeSource>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub evidence: Arc<dyn ChangeEvidence>,
    pub bronze: Arc<dyn AppendSink>,
    pub publisher: Arc<dyn EventPublisher>,
    pub page_size: usize,
}

pub struct Pipeline {
    definition: PipelineDefinition,
    validator: Validator,
    watermarks: Arc<dyn WatermarkStore>,
    extractor: ChangeExtractor,
    detector: SilentFailureDetector,
    loader: AppendLoader,
    publisher: Arc<dyn EventPublisher>,
}

impl Pipeline {
    pub fn new(
        definition: PipelineDefinition,
        rules: SourceRules,
        resources: &PipelineResources,
    ) -> Self {
        Self {
            definition,
            validator: Validator::new(rules),
            watermarks: resources.watermarks.clone(),
            extractor: ChangeExtractor::new(resources.source.clone(), resources.page_size),
            detector: SilentFailureDetector::new(resources.evidence.clone()),
            loader: AppendLoader::new(resources.bronze.clone()),
            publisher: resources.publisher.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.pipeline_id
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub async fn get_watermark(&self, _ctx: &RunContext) -> Result<StepOutput> {
        let watermark = self.watermarks.get(&self.definition.source_name).await?;
        Ok(StepOutput::Watermark(watermark))
    }

    pub async fn extract(&self, ctx: &RunContext) -> Result<StepOutput> {
        let batch = self.extractor.extract(&self.definition, ctx.watermark()?).await?;
        Ok(StepOutput::Extracted(batch))
    }

    /// Includes the silent-failure check for empty extractions. A rejected
    /// batch leaves a `failed` entry under the bronze table.
    pub async fn validate(&self, ctx: &RunContext) -> Result<StepOutput> {
        let extracted = ctx.extracted()?;
        if extracted.rows.is_empty() {
            if let Err(err) = self
                .detector
                .check(&self.definition, ctx.watermark()?, 0)
                .await
            {
                self.loader
                    .reject(
                        &self.definition.bronze_table,
                        &ctx.run_id,
                        Utc::now(),
                        0,
                        &err.to_string(),
                    )
                    .await;
                return Err(err);
            }
            return Ok(StepOutput::Validated(ValidatedBatch {
                batch: NormalizedBatch::default(),
                report: ValidationReport::default(),
            }));
        }

        let rules = self.validator.rules();
        let batch = normalize(rules, &header_of(&extracted.rows), extracted.rows.clone());
        let report = self.validator.validate(&batch).await;
        if !report.is_valid() {
            self.loader
                .load(
                    &self.definition.bronze_table,
                    rules,
                    &batch,
                    &report,
                    &ctx.run_id,
                    Utc::now(),
                )
                .await;
            return Err(Error::ValidationFailed {
                source_name: self.definition.source_name.clone(),
                errors: report.errors,
            });
        }
        Ok(StepOutput::Validated(ValidatedBatch { batch, report }))
    }

    pub async fn load(&self, ctx: &RunContext) -> Result<StepOutput> {
        let validated = ctx.validated()?;
        if validated.batch.is_empty() {
            return Ok(StepOutput::Loaded(LoadResult::written(0, 0, None)));
        }

        let result = self
            .loader
            .load(
                &self.definition.bronze_table,
                self.validator.rules(),
                &validated.batch,
                &validated.report,
                &ctx.run_id,
                Utc::now(),
            )
            .await;
        if !result.status.is_durable() {
            return Err(Error::Load {
                table: self.definition.bronze_table.clone(),
                message: result.error_msg.unwrap_or_else(|| "load failed".to_string()),
            });
        }
        Ok(StepOutput::Loaded(result))
    }

    /// Moves the watermark to the newest loaded change, never backwards.
    pub async fn advance_watermark(&self, ctx: &RunContext) -> Result<StepOutput> {
        let loaded = ctx.loaded()?;
        let current = ctx.watermark()?;
        let source = self.definition.source_name.as_str();

        let candidate = match loaded.max_seen_timestamp {
            Some(ts) if loaded.status.is_durable() && loaded.rows_written > 0 => ts,
            _ => {
                info!(source, "No rows loaded, watermark unchanged");
                return Ok(StepOutput::WatermarkAdvanced(None));
            }
        };
        if candidate <= current.value {
            warn!(
                source,
                watermark = %current.value.to_rfc3339(),
                candidate = %candidate.to_rfc3339(),
                "Loaded rows are not newer than the watermark, keeping it"
            );
            return Ok(StepOutput::WatermarkAdvanced(None));
        }

        let next = Watermark::new(source, candidate);
        self.watermarks.set(&next).await?;
        Ok(StepOutput::WatermarkAdvanced(Some(next)))
    }

    /// Emits the downstream event without waiting for the downstream run.
    /// A failed send is logged and reported as `Triggered(None)`.
    pub async fn trigger_downstream(&self, ctx: &RunContext) -> Result<StepOutput> {
        let loaded = ctx.loaded()?;
        let Some(target) = self.definition.downstream_pipeline_id.as_deref() else {
            return Ok(StepOutput::Triggered(None));
        };
        if loaded.rows_written == 0 {
            return Ok(StepOutput::Triggered(None));
        }

        let event = DownstreamEvent::new(target, &self.definition.source_name);
        if let Err(err) = self.publisher.publish(&event).await {
            warn!(
                pipeline = %self.definition.pipeline_id,
                downstream = target,
                error = %err,
                "Downstream trigger was not delivered"
            );
            return Ok(StepOutput::Triggered(None));
        }
        info!(
            pipeline = %self.definition.pipeline_id,
            downstream = target,
            "Triggered downstream pipeline"
        );
        Ok(StepOutput::Triggered(Some(event)))
    }

    pub async fn execute(&self, step: StepId, ctx: &RunContext) -> Result<StepOutput> {
        match step {
            StepId::GetWatermark => self.get_watermark(ctx).await,
            StepId::Extract => self.extract(ctx).await,
            StepId::Validate => self.validate(ctx).await,
            StepId::Load => self.load(ctx).await,
            StepId::AdvanceWatermark => self.advance_watermark(ctx).await,
            StepId::TriggerDownstream => self.trigger_downstream(ctx).await,
        }
    }

    /// Runs every step in order; the first failure aborts the rest.
    pub async fn run(&self) -> std::result::Result<RunContext, StepFailure> {
        let mut ctx = RunContext::new(self.id());
        info!(pipeline = %self.id(), run_id = %ctx.run_id, "Starting pipeline run");

        for step in StepId::ALL {
            match self.execute(step, &ctx).await {
                Ok(output) => ctx.record(step, output),
                Err(error) => {
                    return Err(StepFailure {
                        pipeline_id: self.id().to_string(),
                        step,
                        error,
                    });
                }
            }
        }

        info!(
            pipeline = %self.id(),
            run_id = %ctx.run_id,
            rows = ctx.loaded().map(|r| r.rows_written).unwrap_or(0),
            "Pipeline run complete"
        );
        Ok(ctx)
    }
}
