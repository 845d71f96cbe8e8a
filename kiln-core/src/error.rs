use std::time::Duration;

use thiserror::Error;

use crate::types::JobStatus;

#[derive(Error, Debug)]
pub enum KilnError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A stale non-terminal update raced a terminal one. The ledger absorbs
    /// this; it only escapes from the transition check itself.
    #[error("rejected downgrade of job {job_id}: {from} -> {to}")]
    RejectedDowngrade {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("failed to persist artifact {filename} for job {job_id}: {message}")]
    Persistence {
        job_id: String,
        filename: String,
        message: String,
    },

    #[error(
        "multipart session {session_id} is missing {deficit} of {expected} parts (missing: {missing:?})"
    )]
    IncompleteParts {
        session_id: String,
        expected: u32,
        received: u32,
        deficit: u32,
        missing: Vec<u32>,
    },

    #[error("upload session {session_id} reassembled but registration failed: {source}")]
    ReassemblyFailed {
        session_id: String,
        #[source]
        source: Box<KilnError>,
    },

    #[error("{operation} timed out after {after:?}")]
    UpstreamTimeout {
        operation: String,
        after: Duration,
    },

    #[error("upstream error during {operation}: {message}")]
    Upstream { operation: String, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("session store error: {0}")]
    SessionStore(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KilnError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn upstream(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Upstream {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Whether another attempt of the same outbound call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTimeout { .. } | Self::Upstream { .. })
    }
}

#[cfg(feature = "shared-sessions")]
impl From<redis::RedisError> for KilnError {
    fn from(err: redis::RedisError) -> Self {
        Self::SessionStore(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;
