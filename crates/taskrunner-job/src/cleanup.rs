//! Cleanup job dispatch

use std::sync::Arc;

use taskrunner_common::{ClusterJobView, Record, Result};
use tracing::info;

use crate::context::JobContext;

/// Launches the job that publishes a finished primary job's output
pub struct CleanupDispatcher {
    ctx: Arc<JobContext>,
}

impl CleanupDispatcher {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Create `{name}-cleanup`. Does not check whether one already exists.
    pub async fn launch_cleanup_job(&self, record: &Record) -> Result<ClusterJobView> {
        let manifest = self
            .ctx
            .renderer
            .cleanup_job(record, &self.ctx.settings.manifest)?;
        let view = self.ctx.gateway.create_job(&manifest).await?;
        info!(job = %record.name, record_id = %record.id, cleanup_job = %view.name, "cleanup job dispatched");
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskrunner_cluster::MockClusterGateway;
    use taskrunner_common::{JobStatus, MockObjectStorage};

    use crate::test_support::{context, job_view, record_in};

    #[tokio::test]
    async fn creates_cleanup_job_for_record() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_create_job()
            .withf(|job| job.metadata.name.as_deref() == Some("x-cleanup"))
            .times(1)
            .returning(|job| Ok(job_view(job.metadata.name.as_deref().unwrap_or_default(), true, false, false)));

        let (ctx, store) = context(gateway, MockObjectStorage::new());
        let record = record_in(&store, "x", JobStatus::Cleaning).await;

        let view = CleanupDispatcher::new(ctx)
            .launch_cleanup_job(&record)
            .await
            .unwrap();
        assert_eq!(view.name, "x-cleanup");
    }
}
