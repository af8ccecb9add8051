//! Reduced views of cluster Jobs and Pods
//!
//! The reconciler and the launch polls only care about a handful of fields.
//! These views also end up in error context maps, so they serialize in the
//! camelCase shape of the cluster API.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;

/// What we observe about a cluster Job
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterJobView {
    /// Job name
    pub name: String,
    /// At least one pod is active
    pub active: bool,
    /// At least one pod failed
    pub failed: bool,
    /// At least one pod succeeded
    pub succeeded: bool,
    /// When the cluster started the Job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

impl ClusterJobView {
    /// Reduce a Job to its view
    pub fn from_job(job: &Job) -> Self {
        let status = job.status.as_ref();
        let count = |f: fn(&k8s_openapi::api::batch::v1::JobStatus) -> Option<i32>| {
            status.and_then(f).unwrap_or(0) > 0
        };

        Self {
            name: job.metadata.name.clone().unwrap_or_default(),
            active: count(|s| s.active),
            failed: count(|s| s.failed),
            succeeded: count(|s| s.succeeded),
            start_time: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
        }
    }
}

/// Pod phase as reported by the cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum PodPhase {
    /// Accepted, containers not yet running
    Pending,
    /// At least one container running
    Running,
    /// All containers exited zero
    Succeeded,
    /// At least one container failed
    Failed,
    /// Anything else, including a missing phase
    #[default]
    Unknown,
}

impl PodPhase {
    /// Parse the phase string; unrecognised values map to `Unknown`
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// What we observe about a Pod
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPodView {
    /// Pod name
    pub name: String,
    /// Lifecycle phase
    pub phase: PodPhase,
}

impl ClusterPodView {
    /// Reduce a Pod to its view
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            phase: PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref())),
        }
    }
}
