//! Periodic reconciliation of records against cluster Jobs
//!
//! Each pass lists every Job in the namespace, pairs it with its record, and
//! applies the transition planned by [`transitions`]. Cleanup jobs are handled
//! before primary jobs so that a record finishing its cleanup in this pass is
//! already Succeeded when its primary Job is looked at. A failure on one
//! record is logged and never stops the pass.

pub mod transitions;

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskrunner_common::record::split_job_name;
use taskrunner_common::{ClusterJobView, Error, JobStatus, Record, RecordUpdate, Result};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cleanup::CleanupDispatcher;
use crate::context::JobContext;
use crate::stopper::delete_primary;

pub use transitions::{plan_cleanup, plan_primary, Action, Transition};

/// Counts from one reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub cleanup_jobs: usize,
    pub primary_jobs: usize,
    /// Jobs with no matching record
    pub unmanaged: usize,
    pub failures: usize,
    /// Entries whose record was locked by a launch or stop in progress
    pub busy: usize,
    /// The pass did not run because another was in progress
    pub skipped: bool,
}

/// Drives records toward the cluster's observed state
pub struct Reconciler {
    ctx: Arc<JobContext>,
    cleanup: CleanupDispatcher,
    pass_guard: Mutex<()>,
}

impl Reconciler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self {
            cleanup: CleanupDispatcher::new(ctx.clone()),
            ctx,
            pass_guard: Mutex::new(()),
        }
    }

    /// Run one full pass. Never fails; problems are counted and logged.
    pub async fn run_pass(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let Ok(_pass) = self.pass_guard.try_lock() else {
            warn!("reconciliation pass still running, skipping tick");
            report.skipped = true;
            return report;
        };

        let jobs = match self.ctx.gateway.list_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to list jobs");
                report.failures += 1;
                return report;
            }
        };

        let mut cleanup: BTreeMap<String, (Record, ClusterJobView)> = BTreeMap::new();
        let mut primary: BTreeMap<String, (Record, ClusterJobView)> = BTreeMap::new();

        for job in jobs {
            let (name, is_cleanup) = split_job_name(&job.name);
            let name = name.to_string();

            match self.ctx.store.find_by_name(&name).await {
                Ok(Some(record)) if is_cleanup => {
                    cleanup.insert(name, (record, job));
                }
                Ok(Some(record)) => {
                    primary.insert(name, (record, job));
                }
                Ok(None) => {
                    debug!(job = %job.name, "no record for job, skipping");
                    report.unmanaged += 1;
                }
                Err(e) => {
                    error!(job = %job.name, error = %e, "failed to look up record");
                    report.failures += 1;
                }
            }
        }

        report.cleanup_jobs = cleanup.len();
        report.primary_jobs = primary.len();
        let cleanup_present: HashSet<&str> = cleanup.keys().map(String::as_str).collect();

        for (record, job) in cleanup.values() {
            let Some(_guard) = self.ctx.locks.try_acquire(&record.name) else {
                debug!(job = %record.name, record_id = %record.id, "record busy, leaving it for the next pass");
                report.busy += 1;
                continue;
            };
            if let Err(e) = self.reconcile_cleanup(record, job).await {
                error!(job = %record.name, record_id = %record.id, error = %e, "cleanup reconciliation failed");
                report.failures += 1;
            }
        }

        for (record, job) in primary.values() {
            let Some(_guard) = self.ctx.locks.try_acquire(&record.name) else {
                debug!(job = %record.name, record_id = %record.id, "record busy, leaving it for the next pass");
                report.busy += 1;
                continue;
            };
            if let Err(e) = self.reconcile_primary(record, job, &cleanup_present).await {
                error!(job = %record.name, record_id = %record.id, error = %e, "reconciliation failed");
                report.failures += 1;
            }
        }

        self.ctx.locks.prune_idle();
        report
    }

    /// Caller holds the record's lock
    async fn reconcile_cleanup(&self, record: &Record, job: &ClusterJobView) -> Result<()> {
        let record = self.reload(record).await?;
        let plan = plan_cleanup(record.status, job);
        self.apply(record, plan, &HashSet::new()).await
    }

    async fn reconcile_primary(
        &self,
        record: &Record,
        job: &ClusterJobView,
        cleanup_present: &HashSet<&str>,
    ) -> Result<()> {
        let record = self.reload(record).await?;
        let plan = plan_primary(record.status, job);
        self.apply(record, plan, cleanup_present).await
    }

    async fn reload(&self, record: &Record) -> Result<Record> {
        self.ctx
            .store
            .get(record.id)
            .await?
            .ok_or_else(|| Error::RecordNotFound {
                id: record.id.to_string(),
            })
    }

    /// Apply the status change, then the action. Succeed writes its status
    /// together with the output URL.
    async fn apply(
        &self,
        mut record: Record,
        plan: Transition,
        cleanup_present: &HashSet<&str>,
    ) -> Result<()> {
        if plan.is_noop() {
            return Ok(());
        }
        if let Some(Action::Succeed) = plan.action {
            return self.succeed(&record).await;
        }

        if let Some(next) = plan.status.filter(|s| *s != record.status) {
            let from = record.status;
            record = self
                .ctx
                .store
                .update(record.id, RecordUpdate::new().status(next))
                .await?;
            info!(job = %record.name, record_id = %record.id, %from, to = %next, "record status changed");
        }

        let Some(action) = plan.action else {
            return Ok(());
        };
        let gateway = self.ctx.gateway.as_ref();

        match action {
            Action::Clean => {
                if cleanup_present.contains(record.name.as_str()) {
                    debug!(job = %record.name, "cleanup job already present");
                } else {
                    self.cleanup.launch_cleanup_job(&record).await?;
                }
            }
            Action::DeletePrimary => {
                delete_primary(gateway, &record).await?;
                debug!(job = %record.name, "deleted job and volumes");
            }
            Action::DeleteCleanup => {
                gateway.delete_job(&record.cleanup_job_name(), true).await?;
            }
            Action::Succeed => self.succeed(&record).await?,
        }

        Ok(())
    }

    /// Publish a finished record's output.
    ///
    /// The signed URL is resolved first: until it exists nothing changes and
    /// the cleanup job stays in place, so the next pass tries again. The status,
    /// URL and stop time then land in one update before the cleanup job goes.
    async fn succeed(&self, record: &Record) -> Result<()> {
        let url = self
            .ctx
            .storage
            .signed_url(&record.output_object_key(), self.ctx.settings.output_url_ttl)
            .await?;

        let from = record.status;
        let record = self
            .ctx
            .store
            .update(
                record.id,
                RecordUpdate::new()
                    .status(JobStatus::Succeeded)
                    .output_file_url(url)
                    .stop_time(Utc::now()),
            )
            .await?;
        info!(job = %record.name, record_id = %record.id, %from, to = %record.status, "output published");

        self.ctx
            .gateway
            .delete_job(&record.cleanup_job_name(), true)
            .await
    }

    /// Run a pass every `period` until `shutdown` resolves. Ticks that fall
    /// behind are skipped rather than bunched up.
    pub async fn run_periodic<F>(&self, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(period_secs = period.as_secs(), "reconciler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("reconciler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_pass().await;
                    info!(
                        cleanup_jobs = report.cleanup_jobs,
                        primary_jobs = report.primary_jobs,
                        unmanaged = report.unmanaged,
                        failures = report.failures,
                        busy = report.busy,
                        skipped = report.skipped,
                        "reconciliation pass complete"
                    );
                }
            }
        }
    }
}
