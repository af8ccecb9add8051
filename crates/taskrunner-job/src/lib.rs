//! Batch job lifecycle engine
//!
//! Launches jobs on the cluster and confirms they started, stops them on
//! request, and periodically reconciles local records against the Jobs the
//! cluster reports:
//! - [`JobLauncher`]: dependencies, Job create, bounded start polling
//! - [`JobStopper`]: optimistic Killed, then teardown
//! - [`CleanupDispatcher`]: the output-publishing cleanup job
//! - [`Reconciler`]: full-scan pass driven by a timer
//! - [`JobService`]: the request-level facade

pub mod cleanup;
pub mod context;
pub mod error;
pub mod launcher;
pub mod locks;
pub mod reconcile;
pub mod service;
pub mod stopper;

#[cfg(test)]
mod test_support;

pub use cleanup::CleanupDispatcher;
pub use context::{JobContext, LaunchSettings, PollSettings};
pub use error::JobError;
pub use launcher::{JobLauncher, JobPoll, LaunchOutcome, PodPoll};
pub use locks::RecordLocks;
pub use reconcile::{ReconcileReport, Reconciler};
pub use service::{CreateJobRequest, JobService};
pub use stopper::JobStopper;
