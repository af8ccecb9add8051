//! Dependencies shared by the launcher, stopper and reconciler

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use taskrunner_cluster::ClusterGateway;
use taskrunner_common::manifest::{ManifestRenderer, ManifestSettings, DEFAULT_STORAGE_TOOL_IMAGE};
use taskrunner_common::{Error, ObjectStorage, RecordStore, Result, DEFAULT_URL_TTL};

use crate::locks::RecordLocks;

/// Name of the Secret holding storage credentials
pub const DEFAULT_CREDENTIALS_SECRET: &str = "gcs-api-key";
/// Key of the credentials file within that Secret
pub const DEFAULT_CREDENTIALS_FILENAME: &str = "gcs-api-key.json";
/// Size requested for input and output PVCs
pub const DEFAULT_PVC_SIZE: &str = "100Gi";

/// Bounded polling: `attempts` fetches, `interval` apart
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollSettings {
    /// Job start polling: 3 attempts, 10s apart
    pub const JOB_START: Self = Self {
        attempts: 3,
        interval: Duration::from_secs(10),
    };

    /// Pod start polling: 7 attempts, 10s apart
    pub const POD_START: Self = Self {
        attempts: 7,
        interval: Duration::from_secs(10),
    };
}

/// Everything a launch needs beyond the record itself
#[derive(Clone, Debug)]
pub struct LaunchSettings {
    pub manifest: ManifestSettings,
    /// Credentials file content placed in the credentials Secret
    pub credentials: Vec<u8>,
    pub pvc_size: String,
    pub job_poll: PollSettings,
    pub pod_poll: PollSettings,
    /// Validity of the signed output URL
    pub output_url_ttl: Duration,
}

impl LaunchSettings {
    /// Defaults for everything except where jobs run and where output goes
    pub fn new(namespace: impl Into<String>, bucket_name: impl Into<String>, credentials: Vec<u8>) -> Self {
        Self {
            manifest: ManifestSettings {
                namespace: namespace.into(),
                bucket_name: bucket_name.into(),
                credentials_secret: DEFAULT_CREDENTIALS_SECRET.to_string(),
                credentials_filename: DEFAULT_CREDENTIALS_FILENAME.to_string(),
                backoff_limit: 0,
                storage_tool_image: DEFAULT_STORAGE_TOOL_IMAGE.to_string(),
            },
            credentials,
            pvc_size: DEFAULT_PVC_SIZE.to_string(),
            job_poll: PollSettings::JOB_START,
            pod_poll: PollSettings::POD_START,
            output_url_ttl: DEFAULT_URL_TTL,
        }
    }
}

/// Read the credentials file that will be stored in the cluster Secret
pub async fn read_credentials(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        Error::Config(format!(
            "failed to read credentials file {}: {}",
            path.display(),
            e
        ))
    })
}

/// Shared context assembled once at startup
pub struct JobContext {
    pub gateway: Arc<dyn ClusterGateway>,
    pub store: Arc<dyn RecordStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub renderer: ManifestRenderer,
    pub locks: RecordLocks,
    pub settings: LaunchSettings,
}

impl JobContext {
    /// Create a new JobContext; the manifest templates are loaded here
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        store: Arc<dyn RecordStore>,
        storage: Arc<dyn ObjectStorage>,
        settings: LaunchSettings,
    ) -> Result<Self> {
        Ok(Self {
            gateway,
            store,
            storage,
            renderer: ManifestRenderer::new()?,
            locks: RecordLocks::default(),
            settings,
        })
    }
}
