//! Stopping a running job

use std::sync::Arc;

use chrono::Utc;
use taskrunner_cluster::ClusterGateway;
use taskrunner_common::error::ClusterError;
use taskrunner_common::{JobStatus, Record, RecordUpdate, Result};
use tracing::{info, warn};

use crate::context::JobContext;

/// Delete a primary Job and the PVCs it owns. Missing resources are fine.
pub(crate) async fn delete_primary(gateway: &dyn ClusterGateway, record: &Record) -> Result<()> {
    gateway.delete_job(&record.name, true).await?;
    gateway.delete_pvc(&record.output_pvc_name(), true).await?;
    if record.has_input_file() {
        gateway.delete_pvc(&record.input_pvc_name(), true).await?;
    }
    Ok(())
}

/// Tears down a job's cluster resources on request
pub struct JobStopper {
    ctx: Arc<JobContext>,
}

impl JobStopper {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Mark `record` Killed, then delete its Job and PVCs.
    ///
    /// The record stays Killed even if a delete fails; the next reconciliation
    /// pass retries the deletes for any Killed record whose Job still exists.
    pub async fn stop(&self, record: &Record) -> std::result::Result<(), ClusterError> {
        let _guard = self.ctx.locks.acquire(&record.name).await;
        let name = &record.name;

        let killed = self
            .ctx
            .store
            .update(record.id, RecordUpdate::new().status(JobStatus::Killed))
            .await
            .map_err(|e| ClusterError::wrap(format!("failed to stop job {}", name), &e))?;
        info!(job = %name, record_id = %record.id, "job marked killed");

        if let Err(e) = delete_primary(self.ctx.gateway.as_ref(), &killed).await {
            warn!(job = %name, record_id = %record.id, error = %e, "failed to delete job resources");
            return Err(ClusterError::wrap(
                format!("API request failed while stopping job {}", name),
                &e,
            ));
        }

        self.ctx
            .store
            .update(record.id, RecordUpdate::new().stop_time(Utc::now()))
            .await
            .map_err(|e| ClusterError::wrap(format!("failed to update record for job {}", name), &e))?;
        Ok(())
    }
}
