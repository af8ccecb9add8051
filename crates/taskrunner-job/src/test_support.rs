//! Fixtures shared by the crate's tests

use std::sync::Arc;

use taskrunner_cluster::MockClusterGateway;
use taskrunner_common::{
    ClusterJobView, JobParameters, JobStatus, MemoryRecordStore, MockObjectStorage, Record,
    RecordStore, RecordUpdate,
};

use crate::context::{JobContext, LaunchSettings};

pub(crate) fn settings() -> LaunchSettings {
    LaunchSettings::new("batch", "results", b"{\"type\":\"service_account\"}".to_vec())
}

pub(crate) fn context(
    gateway: MockClusterGateway,
    storage: MockObjectStorage,
) -> (Arc<JobContext>, Arc<MemoryRecordStore>) {
    let store = Arc::new(MemoryRecordStore::new());
    let ctx = JobContext::new(Arc::new(gateway), store.clone(), Arc::new(storage), settings())
        .unwrap();
    (Arc::new(ctx), store)
}

pub(crate) fn params(input: bool) -> JobParameters {
    JobParameters {
        docker_image: "worker:v1".to_string(),
        input_zip: input.then(|| b"PK\x03\x04".to_vec()),
        ..Default::default()
    }
}

/// Insert a record named `name` and walk it to `status` along legal edges
pub(crate) async fn record_in(store: &MemoryRecordStore, name: &str, status: JobStatus) -> Record {
    let record = store
        .insert(Record::new(Some(name.to_string()), params(false)).unwrap())
        .await
        .unwrap();

    let path: &[JobStatus] = match status {
        JobStatus::Created => &[],
        JobStatus::Running => &[JobStatus::Running],
        JobStatus::Failed => &[JobStatus::Failed],
        JobStatus::Cleaning => &[JobStatus::Cleaning],
        JobStatus::Killed => &[JobStatus::Running, JobStatus::Killed],
        JobStatus::Succeeded => &[JobStatus::Cleaning, JobStatus::Succeeded],
    };

    let mut current = record;
    for step in path {
        current = store
            .update(current.id, RecordUpdate::new().status(*step))
            .await
            .unwrap();
    }
    current
}

pub(crate) fn job_view(name: &str, active: bool, failed: bool, succeeded: bool) -> ClusterJobView {
    ClusterJobView {
        name: name.to_string(),
        active,
        failed,
        succeeded,
        start_time: Some(chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()),
    }
}
