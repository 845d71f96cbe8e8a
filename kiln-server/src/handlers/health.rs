use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};

use crate::infra::app_state::AppState;

pub async fn health_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut health_status = json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {}
    });

    let mut is_unhealthy = false;

    match &state.postgres {
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => {
                health_status["checks"]["database"] = json!({
                    "status": "healthy",
                    "type": "postgres"
                });
            }
            Err(e) => {
                health_status["checks"]["database"] = json!({
                    "status": "unhealthy",
                    "type": "postgres",
                    "error": e.to_string()
                });
                is_unhealthy = true;
            }
        },
        None => {
            health_status["checks"]["database"] = json!({
                "status": "healthy",
                "type": "memory"
            });
        }
    }

    health_status["checks"]["sessions"] = json!({
        "status": "healthy",
        "type": if state.shared_sessions { "redis" } else { "memory" }
    });
    health_status["checks"]["realtime"] = json!({
        "status": "healthy",
        "subscribers": state.hub().total_subscribers()
    });

    if is_unhealthy {
        health_status["status"] = json!("unhealthy");
        return Err((StatusCode::SERVICE_UNAVAILABLE, Json(health_status)));
    }

    Ok(Json(health_status))
}
