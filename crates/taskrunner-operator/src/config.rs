//! Operator configuration
//!
//! Every setting is a flag with an environment fallback, parsed once at
//! startup and passed down explicitly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use taskrunner_common::manifest::DEFAULT_STORAGE_TOOL_IMAGE;
use taskrunner_common::{
    BucketStorage, Error, MemoryRecordStore, RecordStore, SqliteRecordStore, DEFAULT_NAMESPACE,
};
use tracing::warn;
use taskrunner_job::context::DEFAULT_PVC_SIZE;
use taskrunner_job::{LaunchSettings, PollSettings};

/// taskrunner - launch and supervise batch jobs on Kubernetes
#[derive(Parser, Debug, Clone)]
#[command(name = "taskrunner", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Namespace jobs are launched into
    #[arg(long, env = "KUBERNETES_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Bucket job input and output are stored in
    #[arg(long, env = "GC_BUCKET_NAME")]
    pub bucket_name: String,

    /// Storage credentials file, copied into the cluster as a Secret
    #[arg(long, env = "GC_CREDENTIALS_FILE_PATH")]
    pub credentials_file: PathBuf,

    /// SQLite file records are kept in; records live in memory when unset
    #[arg(long, env = "DATABASE_PATH")]
    pub database_path: Option<PathBuf>,

    /// Seconds between reconciliation passes
    #[arg(long, env = "JOB_SYNCHRONIZATION_INTERVAL", default_value_t = 30)]
    pub sync_interval_secs: u64,

    /// Address the HTTP API binds to
    #[arg(long, env = "API_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub api_host: IpAddr,

    /// Port the HTTP API listens on
    #[arg(long, env = "API_PORT", default_value_t = 4898)]
    pub api_port: u16,

    /// Log filter directive (overridden by RUST_LOG)
    #[arg(long = "log-level", env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, default_value_t = PollSettings::JOB_START.attempts)]
    pub job_poll_attempts: u32,

    /// Seconds between job start polls
    #[arg(long, default_value_t = PollSettings::JOB_START.interval.as_secs())]
    pub job_poll_interval: u64,

    #[arg(long, default_value_t = PollSettings::POD_START.attempts)]
    pub pod_poll_attempts: u32,

    /// Seconds between pod start polls
    #[arg(long, default_value_t = PollSettings::POD_START.interval.as_secs())]
    pub pod_poll_interval: u64,

    /// Size requested for input and output volumes
    #[arg(long, env = "PVC_SIZE", default_value = DEFAULT_PVC_SIZE)]
    pub pvc_size: String,

    /// Image used to move archives between volumes and the bucket
    #[arg(long, env = "STORAGE_TOOL_IMAGE", default_value = DEFAULT_STORAGE_TOOL_IMAGE)]
    pub storage_tool_image: String,
}

impl OperatorConfig {
    /// Reject settings that would make polling or scheduling meaningless
    pub fn validate(&self) -> Result<(), Error> {
        if self.sync_interval_secs == 0 {
            return Err(Error::Config(
                "JOB_SYNCHRONIZATION_INTERVAL must be at least 1 second".to_string(),
            ));
        }
        if self.job_poll_attempts == 0 || self.pod_poll_attempts == 0 {
            return Err(Error::Config("poll attempts must be at least 1".to_string()));
        }
        if self.bucket_name.trim().is_empty() {
            return Err(Error::Config("GC_BUCKET_NAME cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::new(self.api_host, self.api_port)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// The record store `database_path` selects
    pub fn record_store(&self) -> Result<Arc<dyn RecordStore>, Error> {
        match &self.database_path {
            Some(path) => Ok(Arc::new(SqliteRecordStore::open(path)?)),
            None => {
                warn!("no database path configured, records will not survive a restart");
                Ok(Arc::new(MemoryRecordStore::new()))
            }
        }
    }

    /// The bucket job archives are exchanged through
    pub fn object_storage(&self) -> Result<BucketStorage, Error> {
        BucketStorage::gcs(&self.bucket_name, &self.credentials_file)
    }

    /// Launch settings with the credentials file content already loaded
    pub fn launch_settings(&self, credentials: Vec<u8>) -> LaunchSettings {
        let mut settings = LaunchSettings::new(&self.namespace, &self.bucket_name, credentials);
        settings.pvc_size = self.pvc_size.clone();
        settings.manifest.storage_tool_image = self.storage_tool_image.clone();
        settings.job_poll = PollSettings {
            attempts: self.job_poll_attempts,
            interval: Duration::from_secs(self.job_poll_interval),
        };
        settings.pod_poll = PollSettings {
            attempts: self.pod_poll_attempts,
            interval: Duration::from_secs(self.pod_poll_interval),
        };
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> OperatorConfig {
        let mut args = vec![
            "taskrunner",
            "--namespace",
            "batch",
            "--bucket-name",
            "results",
            "--credentials-file",
            "/etc/taskrunner/creds.json",
        ];
        args.extend_from_slice(extra);
        OperatorConfig::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults_mirror_deployment_settings() {
        let config = parse(&[]);
        assert_eq!(config.api_port, 4898);
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.job_poll_attempts, 3);
        assert_eq!(config.pod_poll_attempts, 7);
        assert_eq!(config.pvc_size, "100Gi");
        config.validate().unwrap();
    }

    #[test]
    fn launch_settings_carry_overrides() {
        let config = parse(&["--job-poll-attempts", "5", "--pod-poll-interval", "2"]);
        let settings = config.launch_settings(b"{}".to_vec());

        assert_eq!(settings.manifest.namespace, "batch");
        assert_eq!(settings.manifest.bucket_name, "results");
        assert_eq!(settings.job_poll.attempts, 5);
        assert_eq!(settings.pod_poll.interval, Duration::from_secs(2));
        assert_eq!(settings.credentials, b"{}".to_vec());
    }

    #[tokio::test]
    async fn database_path_selects_persistent_store() {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("taskrunner-config-{ts}.sqlite"));
        let config = parse(&["--database-path", path.to_str().unwrap()]);

        let record = taskrunner_common::Record::new(
            Some("kept".to_string()),
            taskrunner_common::JobParameters {
                docker_image: "worker:v1".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        config.record_store().unwrap().insert(record).await.unwrap();

        let reopened = config.record_store().unwrap();
        assert!(reopened.find_by_name("kept").await.unwrap().is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn no_database_path_keeps_records_in_memory() {
        if std::env::var("DATABASE_PATH").is_ok() {
            return;
        }
        let config = parse(&[]);
        assert!(config.database_path.is_none());
        assert!(config.record_store().unwrap().list(None).await.unwrap().is_empty());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = parse(&["--sync-interval-secs", "0"]);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn bucket_is_required() {
        if std::env::var("GC_BUCKET_NAME").is_ok() {
            return;
        }
        let result = OperatorConfig::try_parse_from([
            "taskrunner",
            "--credentials-file",
            "/etc/taskrunner/creds.json",
        ]);
        assert!(result.is_err());
    }
}
