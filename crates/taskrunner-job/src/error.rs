//! Job service error types

use taskrunner_common::{ClusterError, Error, JobStatus, RecordId};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("a job named '{0}' already exists")]
    NameTaken(String),

    #[error("job {id} cannot be stopped while {status}")]
    NotStoppable { id: RecordId, status: JobStatus },

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("{0}")]
    Common(Error),
}

impl From<Error> for JobError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation { .. } => Self::Invalid(err.to_string()),
            Error::NameTaken { name } => Self::NameTaken(name),
            Error::RecordNotFound { id } => Self::NotFound(id),
            other => Self::Common(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_errors_are_classified() {
        assert!(matches!(
            JobError::from(Error::validation("name", "bad")),
            JobError::Invalid(_)
        ));
        assert!(matches!(
            JobError::from(Error::NameTaken { name: "x".into() }),
            JobError::NameTaken(ref n) if n == "x"
        ));
        assert!(matches!(
            JobError::from(Error::RecordNotFound { id: "1".into() }),
            JobError::NotFound(_)
        ));
        assert!(matches!(
            JobError::from(Error::storage("k", "down")),
            JobError::Common(_)
        ));
    }

    #[test]
    fn cluster_errors_display_their_message() {
        let err = JobError::from(ClusterError::new("Job x failed to start"));
        assert_eq!(err.to_string(), "Job x failed to start");
    }
}
