use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kiln_core::KilnError;
use serde_json::{Value, json};
use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Extra fields merged into the error body.
    pub details: Option<Value>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "message": self.message,
            "status": self.status.as_u16(),
        });
        if let (Some(Value::Object(details)), Some(body)) =
            (self.details, error.as_object_mut())
        {
            body.extend(details);
        }

        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<KilnError> for AppError {
    fn from(err: KilnError) -> Self {
        match err {
            KilnError::NotFound { .. } => Self::not_found(err.to_string()),
            KilnError::InvalidInput(msg) => Self::bad_request(msg),
            KilnError::IncompleteParts {
                ref session_id,
                expected,
                received,
                deficit,
                ref missing,
            } => {
                let details = json!({
                    "sessionId": session_id,
                    "expected": expected,
                    "received": received,
                    "deficit": deficit,
                    "missing": missing,
                });
                Self::conflict(err.to_string()).with_details(details)
            }
            KilnError::UpstreamTimeout { .. } => Self::gateway_timeout(err.to_string()),
            KilnError::Upstream { .. } => Self::bad_gateway(err.to_string()),
            KilnError::ReassemblyFailed {
                ref session_id,
                ref source,
            } => {
                let status = match source.as_ref() {
                    KilnError::NotFound { .. } => StatusCode::NOT_FOUND,
                    KilnError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                Self::new(status, err.to_string())
                    .with_details(json!({ "sessionId": session_id }))
            }
            KilnError::Persistence { .. } => {
                tracing::error!(error = %err, "artifact persistence failed");
                Self::internal(err.to_string())
            }
            KilnError::Database(ref source) => {
                tracing::error!(error = ?source, "database operation failed");
                Self::internal("Database operation failed")
            }
            other => {
                tracing::error!(error = %other, "request failed");
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_parts_reports_deficit() {
        let err = AppError::from(KilnError::IncompleteParts {
            session_id: "s1".into(),
            expected: 3,
            received: 2,
            deficit: 1,
            missing: vec![3],
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        let details = err.details.unwrap();
        assert_eq!(details["deficit"], 1);
        assert_eq!(details["missing"], json!([3]));
    }

    #[test]
    fn upstream_failures_map_to_gateway_statuses() {
        assert_eq!(
            AppError::from(KilnError::upstream("download", "reset")).status,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::from(KilnError::UpstreamTimeout {
                operation: "download".into(),
                after: std::time::Duration::from_secs(30),
            })
            .status,
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn reassembly_failure_keeps_the_cause_status() {
        let err = AppError::from(KilnError::ReassemblyFailed {
            session_id: "s1".into(),
            source: Box::new(KilnError::not_found("job", "j1")),
        });
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.details.unwrap()["sessionId"], "s1");
    }
}
