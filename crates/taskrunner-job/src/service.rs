//! Request-level entry points: create, stop, get, list

use std::sync::Arc;

use taskrunner_common::{JobParameters, JobStatus, Record, RecordId};
use tracing::info;

use crate::context::JobContext;
use crate::error::JobError;
use crate::launcher::{JobLauncher, LaunchOutcome};
use crate::stopper::JobStopper;

/// A request to run a job
#[derive(Clone, Debug, Default)]
pub struct CreateJobRequest {
    /// Explicit name; derived from the image when absent
    pub name: Option<String>,
    pub job_parameters: JobParameters,
}

/// Facade the HTTP layer talks to
pub struct JobService {
    ctx: Arc<JobContext>,
    launcher: JobLauncher,
    stopper: JobStopper,
}

impl JobService {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self {
            launcher: JobLauncher::new(ctx.clone()),
            stopper: JobStopper::new(ctx.clone()),
            ctx,
        }
    }

    /// Create a record and launch it. The name is reserved in the store
    /// before any cluster call, so a duplicate never reaches the cluster.
    ///
    /// Returns the new record's id and whether the job was still running
    /// when the launch returned.
    pub async fn create(&self, request: CreateJobRequest) -> Result<(RecordId, LaunchOutcome), JobError> {
        let record = Record::new(request.name, request.job_parameters)?;
        let record = self.ctx.store.insert(record).await?;
        info!(job = %record.name, record_id = %record.id, image = %record.job_parameters.docker_image, "job record created");

        let outcome = self.launcher.create(&record).await?;
        if outcome == LaunchOutcome::FinishedInstantly {
            info!(job = %record.name, record_id = %record.id, "job finished during launch, awaiting cleanup");
        }
        Ok((record.id, outcome))
    }

    /// Stop a Running or Cleaning job
    pub async fn stop(&self, id: RecordId) -> Result<(), JobError> {
        let record = self.get(id).await?;
        if !record.status.is_stoppable() {
            return Err(JobError::NotStoppable {
                id,
                status: record.status,
            });
        }
        self.stopper.stop(&record).await?;
        Ok(())
    }

    pub async fn get(&self, id: RecordId) -> Result<Record, JobError> {
        self.ctx
            .store
            .get(id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Records in `status`, Running when unspecified
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Record>, JobError> {
        let status = status.unwrap_or(JobStatus::Running);
        Ok(self.ctx.store.list(Some(status)).await?)
    }
}
