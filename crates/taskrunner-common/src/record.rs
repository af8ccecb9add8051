//! The local job record and its lifecycle
//!
//! A [`Record`] is created in `Created` and only ever moves along the edges
//! permitted by [`JobStatus::can_transition_to`]:
//!
//! ```text
//! Created  → Running | Cleaning | Failed
//! Running  → Cleaning | Failed | Killed
//! Cleaning → Failed | Succeeded | Killed
//! Failed, Killed, Succeeded are terminal
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, CLEANUP_JOB_SUFFIX};

// =============================================================================
// Identity
// =============================================================================

/// Opaque, generator-assigned record identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::validation("id", e.to_string()))
    }
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of a job record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted locally, nothing confirmed on the cluster yet
    #[default]
    Created,
    /// The Job's pod was observed running
    Running,
    /// The job failed (at launch, on the cluster, or in cleanup)
    Failed,
    /// Stopped on request
    Killed,
    /// The primary job finished and its cleanup job is collecting output
    Cleaning,
    /// Output was collected and published
    Succeeded,
}

impl JobStatus {
    /// Every status, in declaration order
    pub const ALL: [JobStatus; 6] = [
        Self::Created,
        Self::Running,
        Self::Failed,
        Self::Killed,
        Self::Cleaning,
        Self::Succeeded,
    ];

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Self-transitions are always permitted and are no-ops.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Created, Running | Cleaning | Failed)
                | (Running, Cleaning | Failed | Killed)
                | (Cleaning, Failed | Succeeded | Killed)
        )
    }

    /// Whether a stop request may be honoured in this status
    pub fn is_stoppable(self) -> bool {
        matches!(self, Self::Running | Self::Cleaning)
    }

    /// Lowercase wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Cleaning => "cleaning",
            Self::Succeeded => "succeeded",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::validation("status", format!("unknown status '{}'", s)))
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// CPU and memory quantities, e.g. `{"cpu": "500m", "memory": "128Mi"}`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceQuantities {
    /// CPU quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Container resource requests and limits
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceRequirements {
    /// Guaranteed resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceQuantities>,
    /// Upper bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceQuantities>,
}

/// What to run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameters {
    /// Container image reference
    pub docker_image: String,
    /// Environment passed to the container
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    /// Optional zip archive made available under `/input`
    #[serde(skip)]
    pub input_zip: Option<Vec<u8>>,
    /// Resource requests and limits
    #[serde(default)]
    pub resources: ResourceRequirements,
}

// =============================================================================
// Record
// =============================================================================

/// A batch job as tracked locally
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    /// Identity
    pub id: RecordId,
    /// Cluster-facing name; unique and immutable
    pub name: String,
    /// Lifecycle status
    pub status: JobStatus,
    /// What to run
    pub job_parameters: JobParameters,
    /// When the cluster started the job
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the job stopped (killed or output published)
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub stop_time: Option<DateTime<Utc>>,
    /// Signed URL of the published output archive
    pub output_file_url: Option<String>,
    /// When the record was created
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,
}

impl Record {
    /// Build a new record in `Created`.
    ///
    /// When `name` is absent it is derived from the image and the creation
    /// time. Either way it is validated before the record is returned.
    pub fn new(name: Option<String>, job_parameters: JobParameters) -> Result<Self, Error> {
        if job_parameters.docker_image.trim().is_empty() {
            return Err(Error::validation(
                "job_parameters.docker_image",
                "image reference cannot be empty",
            ));
        }

        let created = Utc::now();
        let name = name.unwrap_or_else(|| derive_job_name(&job_parameters.docker_image, created));
        validate_job_name(&name)?;

        Ok(Self {
            id: RecordId::new(),
            name,
            status: JobStatus::Created,
            job_parameters,
            start_time: None,
            stop_time: None,
            output_file_url: None,
            created,
        })
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// Returns `true` when the status actually changed.
    pub fn transition(&mut self, next: JobStatus) -> Result<bool, Error> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let changed = self.status != next;
        self.status = next;
        Ok(changed)
    }

    /// Whether an input archive was supplied
    pub fn has_input_file(&self) -> bool {
        self.job_parameters.input_zip.is_some()
    }

    /// Name of the cleanup Job
    pub fn cleanup_job_name(&self) -> String {
        format!("{}{}", self.name, CLEANUP_JOB_SUFFIX)
    }

    /// Name of the input PVC
    pub fn input_pvc_name(&self) -> String {
        format!("job-{}-input", self.name)
    }

    /// Name of the output PVC
    pub fn output_pvc_name(&self) -> String {
        format!("job-{}-output", self.name)
    }

    /// Object storage key the input archive is uploaded under
    pub fn input_object_key(&self) -> String {
        format!("{}-input.zip", self.name)
    }

    /// Object storage key the cleanup job publishes output under
    pub fn output_object_key(&self) -> String {
        format!("{}-output.zip", self.name)
    }
}

/// Longest record name whose cleanup job name still fits a 63-character label
pub const MAX_JOB_NAME_LEN: usize = 63 - CLEANUP_JOB_SUFFIX.len();

/// Validate a job name against `^[a-z0-9]([-a-z0-9]*[a-z0-9])?$` and
/// [`MAX_JOB_NAME_LEN`].
///
/// The name becomes the cluster Job name and the `job-name` label value, so it
/// must be a valid DNS label body.
pub fn validate_job_name(name: &str) -> Result<(), Error> {
    const PATTERN: &str = "^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();

    let valid = match (name.chars().next(), name.chars().last()) {
        (Some(first), Some(last)) => {
            alnum(first) && alnum(last) && name.chars().all(|c| alnum(c) || c == '-')
        }
        _ => false,
    };

    if !valid {
        return Err(Error::validation(
            "name",
            format!("'{}' did not match validation regex '{}'", name, PATTERN),
        ));
    }
    if name.len() > MAX_JOB_NAME_LEN {
        return Err(Error::validation(
            "name",
            format!("'{}' is longer than {} characters", name, MAX_JOB_NAME_LEN),
        ));
    }
    Ok(())
}

/// Derive `{slug(image)}-{created_ms}`, cutting the slug short so the
/// result stays within [`MAX_JOB_NAME_LEN`]
pub fn derive_job_name(image: &str, created: DateTime<Utc>) -> String {
    let millis = created.timestamp_millis().to_string();
    let mut slug = slugify(image);
    slug.truncate(MAX_JOB_NAME_LEN.saturating_sub(millis.len() + 1));
    format!("{}-{}", slug.trim_end_matches('-'), millis)
}

/// Lowercase, collapse every run of non-alphanumerics into a single `-`,
/// and trim leading/trailing hyphens.
fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_hyphen = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    if slug.is_empty() {
        slug.push_str("job");
    }
    slug
}

/// Split a cluster Job name into its primary record name and whether it is a
/// cleanup job.
pub fn split_job_name(job_name: &str) -> (&str, bool) {
    match job_name.strip_suffix(CLEANUP_JOB_SUFFIX) {
        Some(primary) if !primary.is_empty() => (primary, true),
        _ => (job_name, false),
    }
}
