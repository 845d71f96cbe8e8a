use axum::{
    Router,
    routing::{delete, get, post, put},
};

use crate::{
    AppState,
    handlers::{callbacks, jobs, realtime, uploads},
};

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        // Provider webhook; authenticated by the network, not by owner
        .route("/callbacks/provider", post(callbacks::provider_callback))
        .merge(create_job_routes())
        .merge(create_upload_routes())
        .merge(create_realtime_routes())
}

fn create_job_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/jobs",
            get(jobs::list_jobs)
                .post(jobs::upsert_job)
                .delete(jobs::clear_jobs),
        )
        .route("/jobs/submit", post(jobs::submit_job))
        .route("/jobs/{job_id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{job_id}/recover", post(jobs::recover_job))
        .route("/jobs/{job_id}/artifacts", get(jobs::list_job_artifacts))
        .route(
            "/jobs/{job_id}/artifacts/{artifact_id}",
            get(jobs::download_job_artifact),
        )
}

fn create_upload_routes() -> Router<AppState> {
    Router::new()
        .route("/uploads/chunks", post(uploads::submit_chunk))
        .route("/uploads/multipart", post(uploads::start_multipart))
        .route(
            "/uploads/multipart/{session_id}",
            delete(uploads::abort_multipart),
        )
        .route(
            "/uploads/multipart/{session_id}/parts/{part_number}",
            put(uploads::upload_part),
        )
        .route(
            "/uploads/multipart/{session_id}/complete",
            post(uploads::complete_multipart),
        )
}

fn create_realtime_routes() -> Router<AppState> {
    Router::new()
        .route("/realtime/ws", get(realtime::websocket_handler))
        .route("/realtime/events", get(realtime::events_sse_handler))
}
