//! Common types for taskrunner: the job record model, errors, cluster views,
//! and the store/storage/manifest collaborators shared by every crate.

#![deny(missing_docs)]

pub mod error;
pub mod manifest;
pub mod record;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod view;

pub use error::{ClusterError, Error};
pub use record::{JobParameters, JobStatus, Record, RecordId, ResourceQuantities, ResourceRequirements};
#[cfg(any(test, feature = "testing"))]
pub use storage::MockObjectStorage;
pub use storage::{BucketStorage, ObjectStorage, DEFAULT_URL_TTL, MAX_SIGNED_URL_TTL};
pub use store::{MemoryRecordStore, RecordStore, RecordUpdate, SqliteRecordStore};
pub use view::{ClusterJobView, ClusterPodView, PodPhase};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Suffix appended to a primary job's name to form its cleanup job's name
pub const CLEANUP_JOB_SUFFIX: &str = "-cleanup";

/// Label the cluster stamps on every Pod a Job creates
pub const JOB_NAME_LABEL: &str = "job-name";

/// Value of `app.kubernetes.io/managed-by` on every resource we create
pub const MANAGED_BY: &str = "taskrunner";

/// Default namespace jobs are launched into
pub const DEFAULT_NAMESPACE: &str = "default";
