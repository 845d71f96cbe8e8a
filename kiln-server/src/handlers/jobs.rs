use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::IntoResponse,
};
use kiln_core::{
    submission::SubmitJobRequest,
    types::{ArtifactId, ArtifactRef, GenerationJob, JobCategory, JobId, JobPatch, JobStatus},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::infra::{
    app_state::AppState,
    errors::AppResult,
    owner::Owner,
};

#[derive(Debug, Default, Deserialize)]
pub struct CategoryQuery {
    #[serde(default)]
    pub category: Option<JobCategory>,
}

/// Upsert body: the job identity plus any subset of the patch fields.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertJobRequest {
    pub job_id: JobId,
    #[serde(default)]
    pub category: Option<JobCategory>,
    #[serde(flatten)]
    pub patch: JobPatch,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelJobRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteJobResponse {
    pub job_id: JobId,
    pub artifacts_removed: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearJobsResponse {
    pub cleared: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<JobCategory>,
}

fn job_id(raw: String) -> AppResult<JobId> {
    Ok(JobId::parse(raw)?)
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<CategoryQuery>,
) -> AppResult<Json<Vec<GenerationJob>>> {
    let jobs = state.ledger.list(&owner, query.category).await?;
    Ok(Json(jobs))
}

pub async fn upsert_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    body: Result<Json<UpsertJobRequest>, JsonRejection>,
) -> AppResult<Json<GenerationJob>> {
    let Json(request) = body?;
    let job = state
        .ledger
        .upsert(&owner, &request.job_id, request.category, request.patch)
        .await?;
    Ok(Json(job))
}

pub async fn submit_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    body: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<GenerationJob>)> {
    let Json(request) = body?;
    // The dispatch task records its own outcome in the ledger.
    let submission = state.submissions.submit(&owner, request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission.job)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(raw): Path<String>,
) -> AppResult<Json<GenerationJob>> {
    let job = state.ledger.get_owned(&owner, &job_id(raw)?).await?;
    Ok(Json(job))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(raw): Path<String>,
) -> AppResult<Json<DeleteJobResponse>> {
    let id = job_id(raw)?;
    let job = state.ledger.delete(&owner, &id).await?;
    let artifacts_removed = state.artifacts.delete_for_job(&job.job_id).await?;
    Ok(Json(DeleteJobResponse {
        job_id: job.job_id,
        artifacts_removed,
    }))
}

pub async fn clear_jobs(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<CategoryQuery>,
) -> AppResult<Json<ClearJobsResponse>> {
    let removed = state.ledger.clear_completed(&owner, query.category).await?;
    for job_id in &removed {
        state.artifacts.delete_for_job(job_id).await?;
    }
    Ok(Json(ClearJobsResponse {
        cleared: removed.len() as u64,
        category: query.category,
    }))
}

/// Cancellation is a FAILED patch through the guarded upsert, so cancelling a
/// finished job returns it unchanged.
pub async fn cancel_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(raw): Path<String>,
    body: Option<Json<CancelJobRequest>>,
) -> AppResult<Json<GenerationJob>> {
    let id = job_id(raw)?;
    let current = state.ledger.get_owned(&owner, &id).await?;
    if current.is_terminal() {
        return Ok(Json(current));
    }

    let reason = body
        .and_then(|Json(request)| request.reason)
        .unwrap_or_else(|| "cancelled by user".to_string());
    let patch = JobPatch::default()
        .with_status(JobStatus::Failed)
        .with_error(reason);
    let job = state.ledger.upsert(&owner, &id, None, patch).await?;
    info!(job_id = %job.job_id, status = %job.status, "job cancel requested");
    Ok(Json(job))
}

pub async fn recover_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(raw): Path<String>,
) -> AppResult<Json<GenerationJob>> {
    let job = state.reconciler.recover(&owner, &job_id(raw)?).await?;
    Ok(Json(job))
}

pub async fn list_job_artifacts(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(raw): Path<String>,
) -> AppResult<Json<Vec<ArtifactRef>>> {
    let job = state.ledger.get_owned(&owner, &job_id(raw)?).await?;
    let artifacts = state.artifacts.list_for_job(&job.job_id).await?;
    Ok(Json(artifacts))
}

pub async fn download_job_artifact(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path((raw, artifact_id)): Path<(String, ArtifactId)>,
) -> AppResult<impl IntoResponse> {
    let job = state.ledger.get_owned(&owner, &job_id(raw)?).await?;
    let (artifact, bytes) = state
        .artifacts
        .open(&job.job_id, artifact_id, state.objects.as_ref())
        .await?;
    let disposition = format!("attachment; filename=\"{}\"", artifact.filename);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}
