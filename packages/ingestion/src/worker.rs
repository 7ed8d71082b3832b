//! In-process maintenance worker.
//!
//! Polls the ledger for freshness-check jobs, reaps expired leases and
//! schedules checks for postings past the freshness window. Extraction
//! and enrichment are performed by external workers through the same
//! claim/submit protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use crate::error::Result;
use crate::ledger::JobOutcome;
use crate::pipeline::Pipeline;
use crate::types::{Job, JobErrorKind, JobInput, JobKind};

/// Polling worker for the pipeline's own maintenance jobs.
pub struct PipelineWorker {
    pipeline: Pipeline,
    worker_id: String,
    shutdown: Arc<AtomicBool>,
}

impl PipelineWorker {
    pub fn new(pipeline: Pipeline, worker_id: impl Into<String>) -> Self {
        Self {
            pipeline,
            worker_id: worker_id.into(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for asking the run loop to stop after the current poll.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until the shutdown flag is set.
    pub async fn run(&self) -> Result<()> {
        let poll_interval = self.pipeline.config().poll_interval;
        let batch_size = self.pipeline.config().batch_size;
        info!(worker_id = %self.worker_id, "pipeline worker started");

        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(err) = self.tick(batch_size).await {
                error!(error = %err, "worker tick failed");
            }
            tokio::time::sleep(poll_interval).await;
        }

        info!(worker_id = %self.worker_id, "pipeline worker stopped");
        Ok(())
    }

    /// One poll: reap, schedule, claim, handle.
    pub async fn tick(&self, batch_size: i64) -> Result<()> {
        self.pipeline.reap_expired_leases().await?;
        self.pipeline.schedule_freshness_checks().await?;

        let jobs = self
            .pipeline
            .claim_jobs(&self.worker_id, &[JobKind::CheckFreshness], batch_size)
            .await?;

        for job in jobs {
            self.handle(job).await?;
        }
        Ok(())
    }

    async fn handle(&self, job: Job) -> Result<()> {
        let outcome = match self.run_job(&job).await {
            Ok(result) => JobOutcome::Success(result),
            // The handler failed, not the ledger: report and move on.
            Err(err) => JobOutcome::Failure {
                message: err.to_string(),
                kind: JobErrorKind::Retryable,
            },
        };

        self.pipeline
            .submit_result(job.id, &self.worker_id, outcome_to_work_result(outcome))
            .await?;
        Ok(())
    }

    async fn run_job(&self, job: &Job) -> Result<serde_json::Value> {
        match job.typed_input()? {
            JobInput::CheckFreshness { posting_id } => {
                self.pipeline.check_freshness(posting_id).await
            }
            other => Err(crate::error::IngestError::validation(format!(
                "worker {} cannot handle {} jobs",
                self.worker_id,
                other.kind()
            ))),
        }
    }
}

fn outcome_to_work_result(outcome: JobOutcome) -> crate::pipeline::WorkResult {
    match outcome {
        JobOutcome::Success(payload) => crate::pipeline::WorkResult::Completed(payload),
        JobOutcome::Failure { message, kind } => {
            crate::pipeline::WorkResult::Failed { message, kind }
        }
    }
}
