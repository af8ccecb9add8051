//! Reconciliation decision tables
//!
//! Pure functions from a record's status and the observed Job to the status
//! it should move to and the action to take. No I/O happens here.

use taskrunner_common::{ClusterJobView, JobStatus};

/// Corrective action for one record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Dispatch a cleanup job unless one is already present
    Clean,
    /// Delete the primary Job and its PVCs
    DeletePrimary,
    /// Delete only the cleanup Job
    DeleteCleanup,
    /// Delete the cleanup Job and publish the output URL
    Succeed,
}

/// What reconciliation should do for one record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Status to move to before acting; `None` leaves it unchanged
    pub status: Option<JobStatus>,
    pub action: Option<Action>,
}

impl Transition {
    const NOTHING: Self = Self {
        status: None,
        action: None,
    };

    fn to(status: JobStatus, action: Action) -> Self {
        Self {
            status: Some(status),
            action: Some(action),
        }
    }

    fn act(action: Action) -> Self {
        Self {
            status: None,
            action: Some(action),
        }
    }

    /// True when neither status nor cluster state changes
    pub fn is_noop(&self) -> bool {
        self.status.is_none() && self.action.is_none()
    }
}

/// Plan for a record whose cleanup job was observed
pub fn plan_cleanup(status: JobStatus, job: &ClusterJobView) -> Transition {
    if status != JobStatus::Cleaning || job.active {
        return Transition::NOTHING;
    }
    if job.failed {
        Transition::to(JobStatus::Failed, Action::DeleteCleanup)
    } else if job.succeeded {
        Transition::to(JobStatus::Succeeded, Action::Succeed)
    } else {
        Transition::NOTHING
    }
}

/// Plan for a record whose primary job was observed
pub fn plan_primary(status: JobStatus, job: &ClusterJobView) -> Transition {
    match status {
        JobStatus::Cleaning => Transition::to(JobStatus::Cleaning, Action::Clean),
        JobStatus::Running if job.succeeded => Transition::to(JobStatus::Cleaning, Action::Clean),
        JobStatus::Running if job.failed => Transition::to(JobStatus::Failed, Action::DeletePrimary),
        JobStatus::Running => Transition::NOTHING,
        JobStatus::Succeeded if job.succeeded => Transition::act(Action::DeletePrimary),
        JobStatus::Succeeded => Transition::NOTHING,
        JobStatus::Failed => Transition::to(JobStatus::Failed, Action::DeletePrimary),
        JobStatus::Killed => Transition::act(Action::DeletePrimary),
        JobStatus::Created => Transition::NOTHING,
    }
}
