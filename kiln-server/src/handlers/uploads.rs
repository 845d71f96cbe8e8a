use axum::{
    Json,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use kiln_core::{
    types::{FileDescriptor, JobId, SessionId},
    uploads::{ChunkProgress, MultipartCompletion, MultipartStart, UploadTarget},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
    owner::Owner,
};

/// One chunk of a chunked upload; `bytes` is base64.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub session_id: SessionId,
    pub index: u32,
    pub total_chunks: u32,
    pub bytes: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMultipartRequest {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub job_id: JobId,
    #[serde(flatten)]
    pub descriptor: FileDescriptor,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartRequest {
    pub total_parts: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUploaded {
    pub part_number: u32,
    pub etag: String,
}

fn session_id(raw: String) -> AppResult<SessionId> {
    Ok(SessionId::parse(raw)?)
}

pub async fn submit_chunk(
    State(state): State<AppState>,
    Owner(owner): Owner,
    body: Result<Json<ChunkRequest>, JsonRejection>,
) -> AppResult<Json<ChunkProgress>> {
    let Json(request) = body?;
    let bytes = STANDARD
        .decode(request.bytes.as_bytes())
        .map_err(|err| AppError::bad_request(format!("chunk bytes are not valid base64: {err}")))?;

    // The registered artifact always belongs to the caller.
    let mut metadata = match request.metadata {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        _ => return Err(AppError::bad_request("chunk metadata must be an object")),
    };
    metadata.insert("ownerId".into(), Value::String(owner.to_string()));

    let progress = state
        .chunks
        .submit_chunk(
            request.session_id,
            request.index,
            request.total_chunks,
            bytes,
            Value::Object(metadata),
        )
        .await?;
    Ok(Json(progress))
}

pub async fn start_multipart(
    State(state): State<AppState>,
    Owner(owner): Owner,
    body: Result<Json<StartMultipartRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<MultipartStart>)> {
    let Json(request) = body?;
    // Fail before opening a remote upload nobody can register.
    let job = state.ledger.get_owned(&owner, &request.job_id).await?;

    let target = UploadTarget {
        job_id: job.job_id,
        owner_id: owner,
        descriptor: request.descriptor,
    };
    let started = state.multipart.start(request.session_id, target).await?;
    Ok((StatusCode::CREATED, Json(started)))
}

pub async fn upload_part(
    State(state): State<AppState>,
    Path((raw_session, part_number)): Path<(String, u32)>,
    body: Bytes,
) -> AppResult<Json<PartUploaded>> {
    if body.is_empty() {
        return Err(AppError::bad_request("part body is empty"));
    }
    let etag = state
        .multipart
        .upload_part(&session_id(raw_session)?, part_number, &body)
        .await?;
    Ok(Json(PartUploaded { part_number, etag }))
}

pub async fn complete_multipart(
    State(state): State<AppState>,
    Path(raw_session): Path<String>,
    body: Result<Json<CompleteMultipartRequest>, JsonRejection>,
) -> AppResult<Json<MultipartCompletion>> {
    let Json(request) = body?;
    let completion = state
        .multipart
        .complete(&session_id(raw_session)?, request.total_parts)
        .await?;
    Ok(Json(completion))
}

pub async fn abort_multipart(
    State(state): State<AppState>,
    Path(raw_session): Path<String>,
) -> AppResult<StatusCode> {
    state.multipart.abort(&session_id(raw_session)?).await?;
    Ok(StatusCode::NO_CONTENT)
}
