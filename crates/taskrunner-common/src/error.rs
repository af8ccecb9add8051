//! Error types for taskrunner
//!
//! [`Error`] is the internal taxonomy every collaborator speaks. Callers of the
//! launch and stop pipelines never see it directly: it is folded into a
//! [`ClusterError`], which carries a human message plus a diagnostic context
//! map assembled from the underlying failure.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::record::JobStatus;
use crate::view::{ClusterJobView, ClusterPodView};

/// Context key holding the raw cluster API response body
pub const CLUSTER_RESPONSE: &str = "clusterResponse";
/// Context key holding the last Job snapshot observed while polling
pub const LAST_JOB_RESPONSE: &str = "lastJobResponse";
/// Context key holding the last Pod list observed while polling
pub const LAST_POD_RESPONSE: &str = "lastPodResponse";
/// Context key holding an object storage failure
pub const STORAGE_RESPONSE: &str = "storageResponse";

/// Main error type for taskrunner operations
#[derive(Debug, Error)]
pub enum Error {
    /// The cluster answered with a non-success status
    #[error("cluster API error ({status}): {body}")]
    ClusterApi {
        /// HTTP status code returned by the API server
        status: u16,
        /// Raw response body
        body: serde_json::Value,
    },

    /// The cluster could not be reached at all
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Bounded polling gave up, or observed a state that can never start
    #[error("{message}")]
    JobStartTimeout {
        /// What went wrong
        message: String,
        /// Last Job snapshot observed, if the Job poll was running
        last_job: Option<ClusterJobView>,
        /// Last Pod list observed, if the Pod poll was running
        last_pods: Option<Vec<ClusterPodView>>,
    },

    /// Object storage failure
    #[error("storage error for '{key}': {message}")]
    Storage {
        /// Object key involved
        key: String,
        /// Description of what failed
        message: String,
    },

    /// A record with the same name already exists
    #[error("a job named '{name}' already exists")]
    NameTaken {
        /// The conflicting name
        name: String,
    },

    /// No record exists for the given id
    #[error("record {id} not found")]
    RecordNotFound {
        /// The id that was looked up
        id: String,
    },

    /// A status change not permitted by the record lifecycle
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: JobStatus,
        /// Requested status
        to: JobStatus,
    },

    /// A field failed validation
    #[error("validation error on {field}: {message}")]
    Validation {
        /// Field path (e.g. "name", "job_parameters.docker_image")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Manifest rendering failed
    #[error("template error [{template}]: {message}")]
    Template {
        /// Template name
        template: String,
        /// Description of what failed
        message: String,
    },

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),

    /// The record database failed
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// Classify a kube error: API responses become [`Error::ClusterApi`] with
    /// the response body preserved, everything else stays a transport error.
    pub fn from_kube(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => Self::ClusterApi {
                status: response.code,
                body: serde_json::to_value(&response)
                    .unwrap_or_else(|_| serde_json::Value::String(response.message.clone())),
            },
            other => Self::Kube { source: other },
        }
    }

    /// True when the cluster reported the resource does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ClusterApi { status, .. } => *status == 404,
            Self::Kube {
                source: kube::Error::Api(response),
            } => response.code == 404,
            _ => false,
        }
    }

    /// Create a storage error for the given key
    pub fn storage(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error for the given field
    pub fn validation(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a template error for the given template
    pub fn template(template: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: msg.into(),
        }
    }

    /// Create a job-start timeout carrying the last Job snapshot
    pub fn job_start_timeout(msg: impl Into<String>, last_job: Option<ClusterJobView>) -> Self {
        Self::JobStartTimeout {
            message: msg.into(),
            last_job,
            last_pods: None,
        }
    }

    /// Create a pod-start timeout carrying the last Pod list
    pub fn pod_start_timeout(msg: impl Into<String>, last_pods: Vec<ClusterPodView>) -> Self {
        Self::JobStartTimeout {
            message: msg.into(),
            last_job: None,
            last_pods: Some(last_pods),
        }
    }
}

/// Externally visible failure of a launch or stop request
///
/// `context` is a free-form diagnostic map; the well-known keys are
/// [`CLUSTER_RESPONSE`], [`LAST_JOB_RESPONSE`], [`LAST_POD_RESPONSE`] and
/// [`STORAGE_RESPONSE`].
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[error("{message}")]
pub struct ClusterError {
    /// Human-readable summary
    pub message: String,
    /// Diagnostic payload
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ClusterError {
    /// Create an error with an empty context
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Attach a serializable value under `key`
    pub fn with_context(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.context.insert(key.to_string(), value);
        self
    }

    /// Wrap an internal error, lifting its diagnostic payload into the context
    pub fn wrap(message: impl Into<String>, err: &Error) -> Self {
        let wrapped = Self::new(message);
        match err {
            Error::ClusterApi { body, .. } => wrapped.with_context(CLUSTER_RESPONSE, body),
            Error::Kube { source } => wrapped.with_context(CLUSTER_RESPONSE, source.to_string()),
            Error::JobStartTimeout {
                last_job,
                last_pods,
                ..
            } => {
                let mut wrapped = wrapped;
                if let Some(job) = last_job {
                    wrapped = wrapped.with_context(LAST_JOB_RESPONSE, job);
                }
                if let Some(pods) = last_pods {
                    wrapped = wrapped.with_context(LAST_POD_RESPONSE, pods);
                }
                wrapped
            }
            Error::Storage { .. } => wrapped.with_context(STORAGE_RESPONSE, err.to_string()),
            other => wrapped.with_context("error", other.to_string()),
        }
    }
}
