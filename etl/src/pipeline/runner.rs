use super::{Pipeline, RunContext, StepFailure};
use crate::utils::retry::retry_with_backoff;
use notification::{FailureNotice, FailureNotifier};
use std::sync::Arc;
use tracing::{error, info};

/// Runs pipelines with bounded retries of transient failures and reports
/// terminal failures to the notifier.
pub struct RunDriver {
    max_retries: u32,
    retry_delay_ms: u64,
    notifier: Arc<dyn FailureNotifier>,
}

impl RunDriver {
    pub fn new(max_retries: u32, retry_delay_ms: u64, notifier: Arc<dyn FailureNotifier>) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
            notifier,
        }
    }

    pub async fn run(&self, pipeline: &Pipeline) -> Result<RunContext, StepFailure> {
        let outcome = retry_with_backoff(
            self.max_retries,
            self.retry_delay_ms,
            |failure: &StepFailure| failure.error.is_transient(),
            || pipeline.run(),
        )
        .await;

        match outcome {
            Ok(ctx) => {
                info!(pipeline = %pipeline.id(), run_id = %ctx.run_id, "Pipeline succeeded");
                Ok(ctx)
            }
            Err(failure) => {
                error!(
                    pipeline = %failure.pipeline_id,
                    step = %failure.step,
                    error = %failure.error,
                    "Pipeline failed"
                );
                let notice = FailureNotice::new(
                    &failure.pipeline_id,
                    failure.step.as_str(),
                    &failure.error,
                );
                if let Err(err) = self.notifier.notify(&notice).await {
                    error!(pipeline = %failure.pipeline_id, error = %err, "Failure notice was not delivered");
                }
                Err(failure)
            }
        }
    }
}
