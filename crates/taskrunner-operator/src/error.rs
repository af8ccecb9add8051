//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use taskrunner_job::JobError;

use crate::api::Envelope;

/// Error type for API handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request body or query could not be used
    #[error("{0}")]
    InvalidParameters(String),

    /// No such record
    #[error("{0}")]
    DoesNotExist(String),

    /// Anything the job service reported
    #[error(transparent)]
    Job(#[from] JobError),
}

impl ApiError {
    /// Status code, error kind and diagnostic payload
    fn parts(&self) -> (StatusCode, &'static str, Value) {
        match self {
            Self::InvalidParameters(_) => (StatusCode::BAD_REQUEST, "InvalidParameters", Value::Null),
            Self::DoesNotExist(_) => (StatusCode::NOT_FOUND, "DoesNotExist", Value::Null),
            Self::Job(err) => match err {
                JobError::Invalid(_) | JobError::NameTaken(_) | JobError::NotStoppable { .. } => {
                    (StatusCode::BAD_REQUEST, "InvalidParameters", Value::Null)
                }
                JobError::NotFound(_) => (StatusCode::NOT_FOUND, "DoesNotExist", Value::Null),
                JobError::Cluster(cluster) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ClusterError",
                    serde_json::to_value(&cluster.context).unwrap_or(Value::Null),
                ),
                JobError::Common(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", Value::Null),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, data) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, kind, "request failed");
        }

        let body = Envelope {
            result: false,
            msg: self.to_string(),
            error: Some(kind.to_string()),
            data,
        };
        (status, Json(body)).into_response()
    }
}
