use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use kiln_core::{provider::ProviderEvent, types::GenerationJob};
use tracing::debug;

use crate::infra::{app_state::AppState, errors::AppResult};

/// Provider webhook. Redelivered or out-of-order callbacks are absorbed by the
/// ledger guard and the artifact identity check, so this always answers with
/// the job as it now stands.
pub async fn provider_callback(
    State(state): State<AppState>,
    body: Result<Json<ProviderEvent>, JsonRejection>,
) -> AppResult<Json<GenerationJob>> {
    let Json(event) = body?;
    debug!(
        job_id = %event.job_id,
        status = ?event.patch.status,
        outputs = event.outputs.len(),
        "provider callback received"
    );
    let job = state.ingestor.ingest(event).await?;
    Ok(Json(job))
}
