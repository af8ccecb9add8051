//! HTTP API for submitting, inspecting and stopping batch jobs
//!
//! Every response uses the same envelope: `{result, msg, error, data}`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskrunner_common::{JobParameters, JobStatus, RecordId, ResourceRequirements};
use taskrunner_job::{CreateJobRequest, JobService, LaunchOutcome};
use tracing::info;

use crate::error::ApiError;

/// Uniform response body
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub result: bool,
    pub msg: String,
    pub error: Option<String>,
    pub data: Value,
}

impl Envelope {
    fn ok(msg: impl Into<String>, data: impl Serialize) -> Json<Self> {
        Json(Self {
            result: true,
            msg: msg.into(),
            error: None,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        })
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<JobService>,
}

/// `POST /batch` body
#[derive(Debug, Deserialize)]
pub struct CreateBatchJob {
    #[serde(default)]
    pub name: Option<String>,
    pub job_parameters: JobParametersBody,
}

/// Job parameters as submitted, with the input archive base64-encoded
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobParametersBody {
    pub docker_image: String,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub input_zip: Option<String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl JobParametersBody {
    fn into_parameters(self) -> Result<JobParameters, ApiError> {
        let input_zip = self
            .input_zip
            .filter(|encoded| !encoded.is_empty())
            .map(|encoded| decode_zip(&encoded))
            .transpose()?;

        Ok(JobParameters {
            docker_image: self.docker_image,
            environment_variables: self.environment_variables,
            input_zip,
            resources: self.resources,
        })
    }
}

/// Decode a base64 archive, accepting an optional `data:...;base64,` prefix
fn decode_zip(encoded: &str) -> Result<Vec<u8>, ApiError> {
    let payload = encoded
        .split_once("base64,")
        .map_or(encoded, |(_, rest)| rest);
    STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiError::InvalidParameters(format!("input_zip is not valid base64: {}", e)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// Build the API router
pub fn router(service: Arc<JobService>) -> Router {
    Router::new()
        .route("/batch", get(list_jobs).post(create_job))
        .route("/batch/{id}", get(get_job).delete(stop_job))
        .route("/healthz", get(healthz))
        .with_state(AppState { service })
}

fn parse_id(raw: &str) -> Result<RecordId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::DoesNotExist(format!("Batch job {} not found.", raw)))
}

async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<CreateBatchJob>, JsonRejection>,
) -> Result<Json<Envelope>, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::InvalidParameters(e.body_text()))?;
    let request = CreateJobRequest {
        name: body.name,
        job_parameters: body.job_parameters.into_parameters()?,
    };

    let (id, outcome) = state.service.create(request).await?;
    let record = state.service.get(id).await?;
    info!(job = %record.name, record_id = %id, ?outcome, "batch job submitted");

    let msg = match outcome {
        LaunchOutcome::Started => format!("Batch job {} successfully started.", record.name),
        LaunchOutcome::FinishedInstantly => format!("Batch job {} finished instantly.", record.name),
    };
    Ok(Envelope::ok(msg, record))
}

async fn list_jobs(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Envelope>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::InvalidParameters(e.body_text()))?;
    let status = query
        .status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(|e| ApiError::InvalidParameters(e.to_string()))?;

    let records = state.service.list(status).await?;
    Ok(Envelope::ok("", records))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope>, ApiError> {
    let id = parse_id(&id)?;
    let record = state.service.get(id).await?;
    Ok(Envelope::ok("", record))
}

async fn stop_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope>, ApiError> {
    let id = parse_id(&id)?;
    state.service.stop(id).await?;
    let record = state.service.get(id).await?;
    Ok(Envelope::ok(format!("Batch job {} stopped.", record.name), record))
}

async fn healthz() -> Json<Envelope> {
    Envelope::ok("ok", Value::Null)
}
