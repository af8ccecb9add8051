//! Job launch pipeline
//!
//! Creating a Job is not the same as the Job running. After the create call
//! the launcher polls the Job until the cluster reports it active (or already
//! finished), then polls its Pod until the container is actually running.
//! Both polls are bounded; exhaustion fails the launch with the last snapshot
//! observed so the caller can see how far the job got.

use std::sync::Arc;

use taskrunner_cluster::{job_pod_selector, ClusterGateway};
use taskrunner_common::error::ClusterError;
use taskrunner_common::{
    ClusterJobView, ClusterPodView, Error, JobStatus, PodPhase, Record, RecordUpdate, Result,
};
use tracing::{debug, error, info, warn};

use crate::context::{JobContext, PollSettings};

/// Outcome of polling a Job for start
#[derive(Clone, Debug, PartialEq)]
pub enum JobPoll {
    /// The Job has an active pod
    Started(ClusterJobView),
    /// The Job finished before we saw it active
    AlreadyDone(ClusterJobView),
    /// The Job reported a failed pod
    Failed(ClusterJobView),
    /// No decisive signal within the attempt budget
    TimedOut(Option<ClusterJobView>),
}

/// Outcome of polling a Job's Pod for start
#[derive(Clone, Debug, PartialEq)]
pub enum PodPoll {
    /// The single Pod is running
    Started(ClusterPodView),
    /// The single Pod already succeeded
    Finished(ClusterPodView),
    /// More than one Pod carries the job's label
    Ambiguous(Vec<ClusterPodView>),
    /// No running Pod within the attempt budget
    TimedOut(Vec<ClusterPodView>),
}

/// How a successful launch ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Record moved to Running
    Started,
    /// The job completed during launch; record moved straight to Cleaning
    FinishedInstantly,
}

/// Poll Job `name` until it is active, finished or failed.
///
/// Sleeps only between attempts. Fetch errors end polling immediately.
pub async fn poll_job_until_start(
    gateway: &dyn ClusterGateway,
    name: &str,
    poll: PollSettings,
) -> Result<JobPoll> {
    let mut last = None;

    for attempt in 1..=poll.attempts {
        let job = gateway.get_job(name).await?;

        if job.succeeded {
            return Ok(JobPoll::AlreadyDone(job));
        }
        if job.active {
            return Ok(JobPoll::Started(job));
        }
        if job.failed {
            return Ok(JobPoll::Failed(job));
        }

        debug!(job = %name, attempt, "job not started yet");
        last = Some(job);
        if attempt < poll.attempts {
            tokio::time::sleep(poll.interval).await;
        }
    }

    Ok(JobPoll::TimedOut(last))
}

/// Poll the Pods of Job `name` until its single Pod runs or finishes
pub async fn poll_pod_until_start(
    gateway: &dyn ClusterGateway,
    name: &str,
    poll: PollSettings,
) -> Result<PodPoll> {
    let selector = job_pod_selector(name);
    let mut last = Vec::new();

    for attempt in 1..=poll.attempts {
        let mut pods = gateway.list_pods(&selector).await?;

        if pods.len() > 1 {
            return Ok(PodPoll::Ambiguous(pods));
        }
        let phase = match pods.as_slice() {
            [pod] => Some(pod.phase),
            _ => None,
        };
        match phase {
            Some(PodPhase::Running) => return Ok(PodPoll::Started(pods.remove(0))),
            Some(PodPhase::Succeeded) => return Ok(PodPoll::Finished(pods.remove(0))),
            _ => {}
        }

        debug!(job = %name, attempt, pods = pods.len(), "pod not running yet");
        last = pods;
        if attempt < poll.attempts {
            tokio::time::sleep(poll.interval).await;
        }
    }

    Ok(PodPoll::TimedOut(last))
}

/// Creates a job's cluster resources and confirms it started
pub struct JobLauncher {
    ctx: Arc<JobContext>,
}

impl JobLauncher {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Launch `record`. On any failure the record is marked Failed and the
    /// returned error carries the diagnostic context.
    pub async fn create(&self, record: &Record) -> std::result::Result<LaunchOutcome, ClusterError> {
        let _guard = self.ctx.locks.acquire(&record.name).await;

        match self.launch(record).await {
            Ok(outcome) => {
                info!(job = %record.name, record_id = %record.id, ?outcome, "job launched");
                Ok(outcome)
            }
            Err(err) => {
                error!(job = %record.name, record_id = %record.id, error = %err, "job launch failed");
                if let Err(e) = self
                    .ctx
                    .store
                    .update(record.id, RecordUpdate::new().status(JobStatus::Failed))
                    .await
                {
                    warn!(job = %record.name, record_id = %record.id, error = %e, "failed to mark record failed");
                }
                Err(err)
            }
        }
    }

    async fn launch(&self, record: &Record) -> std::result::Result<LaunchOutcome, ClusterError> {
        let name = &record.name;
        let gateway = self.ctx.gateway.as_ref();

        self.ensure_dependencies(record).await.map_err(|e| {
            ClusterError::wrap(format!("API request failed while creating dependencies for job {}", name), &e)
        })?;

        if let Some(input) = &record.job_parameters.input_zip {
            self.ctx
                .storage
                .upload(&record.input_object_key(), input)
                .await
                .map_err(|e| ClusterError::wrap(format!("failed to upload input for job {}", name), &e))?;
        }

        let manifest = self
            .ctx
            .renderer
            .job(record, &self.ctx.settings.manifest)
            .map_err(|e| ClusterError::wrap(format!("failed to render manifest for job {}", name), &e))?;
        gateway
            .create_job(&manifest)
            .await
            .map_err(|e| ClusterError::wrap(format!("API request failed while creating job {}", name), &e))?;

        let started = match poll_job_until_start(gateway, name, self.ctx.settings.job_poll)
            .await
            .map_err(|e| ClusterError::wrap(format!("API request failed while polling job {}", name), &e))?
        {
            JobPoll::Started(job) => job,
            JobPoll::AlreadyDone(job) => {
                self.record_start(record, JobStatus::Cleaning, &job).await?;
                return Ok(LaunchOutcome::FinishedInstantly);
            }
            JobPoll::Failed(job) => {
                let err = Error::job_start_timeout(format!("Job {} failed", name), Some(job));
                return Err(ClusterError::wrap(format!("Job {} failed to start", name), &err));
            }
            JobPoll::TimedOut(last) => {
                let err = Error::job_start_timeout(format!("Job {} did not start", name), last);
                return Err(ClusterError::wrap(format!("Job {} failed to start", name), &err));
            }
        };

        match poll_pod_until_start(gateway, name, self.ctx.settings.pod_poll)
            .await
            .map_err(|e| ClusterError::wrap(format!("API request failed while polling pods of job {}", name), &e))?
        {
            PodPoll::Started(_) => {
                self.record_start(record, JobStatus::Running, &started).await?;
                Ok(LaunchOutcome::Started)
            }
            PodPoll::Finished(_) => {
                info!(job = %name, "job finished instantly");
                self.record_start(record, JobStatus::Cleaning, &started).await?;
                Ok(LaunchOutcome::FinishedInstantly)
            }
            PodPoll::Ambiguous(pods) => {
                let err = Error::pod_start_timeout(format!("Job {} has {} pods", name, pods.len()), pods);
                Err(ClusterError::wrap(format!("Pod for job {} failed to start", name), &err))
            }
            PodPoll::TimedOut(pods) => {
                let err = Error::pod_start_timeout(format!("Pod for job {} did not start", name), pods);
                Err(ClusterError::wrap(format!("Pod for job {} failed to start", name), &err))
            }
        }
    }

    async fn ensure_dependencies(&self, record: &Record) -> Result<()> {
        let settings = &self.ctx.settings;
        let gateway = self.ctx.gateway.as_ref();

        gateway
            .create_secret_from_file(
                &settings.manifest.credentials_secret,
                &settings.manifest.credentials_filename,
                &settings.credentials,
                true,
            )
            .await?;

        let output = self
            .ctx
            .renderer
            .pvc(&record.output_pvc_name(), &settings.pvc_size, &settings.manifest)?;
        gateway.create_pvc(&output).await?;

        if record.has_input_file() {
            let input = self
                .ctx
                .renderer
                .pvc(&record.input_pvc_name(), &settings.pvc_size, &settings.manifest)?;
            gateway.create_pvc(&input).await?;
        }

        Ok(())
    }

    async fn record_start(
        &self,
        record: &Record,
        status: JobStatus,
        job: &ClusterJobView,
    ) -> std::result::Result<(), ClusterError> {
        self.ctx
            .store
            .update(
                record.id,
                RecordUpdate::new().status(status).start_time(job.start_time),
            )
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::wrap(format!("failed to update record for job {}", record.name), &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use taskrunner_cluster::MockClusterGateway;
    use taskrunner_common::error::{CLUSTER_RESPONSE, LAST_JOB_RESPONSE, LAST_POD_RESPONSE};
    use taskrunner_common::{MockObjectStorage, RecordStore};

    use crate::test_support::{context, job_view, params};

    fn pod(name: &str, phase: PodPhase) -> ClusterPodView {
        ClusterPodView {
            name: name.to_string(),
            phase,
        }
    }

    /// Gateway that accepts every dependency and job create
    fn accepting_gateway() -> MockClusterGateway {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_create_secret_from_file()
            .withf(|name, filename, _, ignore| {
                name == "gcs-api-key" && filename == "gcs-api-key.json" && *ignore
            })
            .returning(|_, _, _, _| Ok(()));
        gateway.expect_create_pvc().returning(|_| Ok(()));
        gateway
            .expect_create_job()
            .returning(|job| Ok(job_view(job.metadata.name.as_deref().unwrap_or_default(), false, false, false)));
        gateway
    }

    async fn launch(
        gateway: MockClusterGateway,
        storage: MockObjectStorage,
        input: bool,
    ) -> (std::result::Result<LaunchOutcome, ClusterError>, Record) {
        let (ctx, store) = context(gateway, storage);
        let record = store
            .insert(Record::new(Some("x".to_string()), params(input)).unwrap())
            .await
            .unwrap();
        let result = JobLauncher::new(ctx).create(&record).await;
        let reloaded = store.get(record.id).await.unwrap().unwrap();
        (result, reloaded)
    }

    // =========================================================================
    // Polling
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn job_poll_exhausts_exactly_n_attempts_and_keeps_last_snapshot() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut gateway = MockClusterGateway::new();
        gateway.expect_get_job().times(3).returning(move |name| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let mut view = job_view(name, false, false, false);
            view.name = format!("{}-{}", name, n);
            Ok(view)
        });

        let started = tokio::time::Instant::now();
        let outcome = poll_job_until_start(&gateway, "x", PollSettings::JOB_START)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match outcome {
            JobPoll::TimedOut(Some(last)) => assert_eq!(last.name, "x-3"),
            other => panic!("expected TimedOut, got {other:?}"),
        }
        // Two sleeps between three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn job_poll_prefers_succeeded_over_active() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_get_job()
            .times(1)
            .returning(|name| Ok(job_view(name, true, false, true)));

        let outcome = poll_job_until_start(&gateway, "x", PollSettings::JOB_START)
            .await
            .unwrap();
        assert!(matches!(outcome, JobPoll::AlreadyDone(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn job_poll_stops_on_fetch_error() {
        let mut gateway = MockClusterGateway::new();
        gateway.expect_get_job().times(1).returning(|_| {
            Err(Error::ClusterApi {
                status: 500,
                body: serde_json::json!({"message": "etcd unavailable"}),
            })
        });

        assert!(poll_job_until_start(&gateway, "x", PollSettings::JOB_START)
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pod_poll_retries_pending_then_starts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_list_pods()
            .withf(|selector| selector == "job-name=x")
            .returning(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(match n {
                    0 => vec![],
                    1 => vec![pod("x-abc", PodPhase::Pending)],
                    _ => vec![pod("x-abc", PodPhase::Running)],
                })
            });

        let outcome = poll_pod_until_start(&gateway, "x", PollSettings::POD_START)
            .await
            .unwrap();
        assert_eq!(outcome, PodPoll::Started(pod("x-abc", PodPhase::Running)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pod_poll_rejects_multiple_pods_immediately() {
        let mut gateway = MockClusterGateway::new();
        gateway.expect_list_pods().times(1).returning(|_| {
            Ok(vec![
                pod("x-a", PodPhase::Running),
                pod("x-b", PodPhase::Pending),
            ])
        });

        let outcome = poll_pod_until_start(&gateway, "x", PollSettings::POD_START)
            .await
            .unwrap();
        assert!(matches!(outcome, PodPoll::Ambiguous(ref pods) if pods.len() == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn pod_poll_times_out_with_last_list() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_list_pods()
            .times(7)
            .returning(|_| Ok(vec![pod("x-abc", PodPhase::Pending)]));

        let outcome = poll_pod_until_start(&gateway, "x", PollSettings::POD_START)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PodPoll::TimedOut(vec![pod("x-abc", PodPhase::Pending)])
        );
    }

    // =========================================================================
    // Launch stories
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn active_job_with_running_pod_moves_record_to_running() {
        let mut gateway = accepting_gateway();
        gateway
            .expect_get_job()
            .times(1)
            .returning(|name| Ok(job_view(name, true, false, false)));
        gateway
            .expect_list_pods()
            .times(1)
            .returning(|_| Ok(vec![pod("x-abc", PodPhase::Running)]));

        let (result, record) = launch(gateway, MockObjectStorage::new(), false).await;

        assert_eq!(result.unwrap(), LaunchOutcome::Started);
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.start_time, job_view("x", true, false, false).start_time);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_marks_record_failed_with_last_job_context() {
        let mut gateway = accepting_gateway();
        gateway
            .expect_get_job()
            .times(1)
            .returning(|name| Ok(job_view(name, false, true, false)));
        gateway.expect_list_pods().never();

        let (result, record) = launch(gateway, MockObjectStorage::new(), false).await;

        let err = result.unwrap_err();
        assert_eq!(err.message, "Job x failed to start");
        assert_eq!(err.context[LAST_JOB_RESPONSE]["failed"], true);
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn already_succeeded_job_skips_pod_polling() {
        let mut gateway = accepting_gateway();
        gateway
            .expect_get_job()
            .times(1)
            .returning(|name| Ok(job_view(name, false, false, true)));
        gateway.expect_list_pods().never();

        let (result, record) = launch(gateway, MockObjectStorage::new(), false).await;

        assert_eq!(result.unwrap(), LaunchOutcome::FinishedInstantly);
        assert_eq!(record.status, JobStatus::Cleaning);
        assert!(record.start_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn succeeded_pod_moves_record_to_cleaning() {
        let mut gateway = accepting_gateway();
        gateway
            .expect_get_job()
            .returning(|name| Ok(job_view(name, true, false, false)));
        gateway
            .expect_list_pods()
            .returning(|_| Ok(vec![pod("x-abc", PodPhase::Succeeded)]));

        let (result, record) = launch(gateway, MockObjectStorage::new(), false).await;

        assert_eq!(result.unwrap(), LaunchOutcome::FinishedInstantly);
        assert_eq!(record.status, JobStatus::Cleaning);
    }

    #[tokio::test(start_paused = true)]
    async fn pod_timeout_fails_with_last_pod_context() {
        let mut gateway = accepting_gateway();
        gateway
            .expect_get_job()
            .returning(|name| Ok(job_view(name, true, false, false)));
        gateway.expect_list_pods().times(7).returning(|_| Ok(vec![]));

        let (result, record) = launch(gateway, MockObjectStorage::new(), false).await;

        let err = result.unwrap_err();
        assert_eq!(err.context[LAST_POD_RESPONSE], serde_json::json!([]));
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn input_archive_gets_pvc_and_upload() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_create_secret_from_file()
            .returning(|_, _, _, _| Ok(()));
        gateway
            .expect_create_pvc()
            .times(2)
            .returning(|_| Ok(()));
        gateway
            .expect_create_job()
            .returning(|_| Ok(job_view("x", false, false, false)));
        gateway
            .expect_get_job()
            .returning(|name| Ok(job_view(name, false, false, true)));

        let mut storage = MockObjectStorage::new();
        storage
            .expect_upload()
            .withf(|key, bytes| key == "x-input.zip" && bytes.starts_with(b"PK"))
            .times(1)
            .returning(|_, _| Ok(()));

        let (result, _) = launch(gateway, storage, true).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn dependency_failure_stops_before_job_create() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_create_secret_from_file()
            .returning(|_, _, _, _| Ok(()));
        gateway.expect_create_pvc().returning(|_| {
            Err(Error::ClusterApi {
                status: 403,
                body: serde_json::json!({"reason": "Forbidden"}),
            })
        });
        gateway.expect_create_job().never();

        let (result, record) = launch(gateway, MockObjectStorage::new(), false).await;

        let err = result.unwrap_err();
        assert_eq!(err.context[CLUSTER_RESPONSE]["reason"], "Forbidden");
        assert_eq!(record.status, JobStatus::Failed);
    }
}
