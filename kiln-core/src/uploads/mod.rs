//! Large upload ingestion: client-chunked reassembly and object store
//! multipart uploads, both ending in artifact registration.

pub mod chunked;
pub mod multipart;
#[cfg(feature = "shared-sessions")]
pub mod redis_sessions;
pub mod registration;
pub mod sessions;

use serde::{Deserialize, Serialize};

use crate::{
    error::{KilnError, Result},
    storage::artifact_key,
    types::{FileDescriptor, JobId, OwnerId},
};

pub use chunked::{ChunkProgress, ChunkReassemblyService};
pub use multipart::{MultipartCompletion, MultipartStart, MultipartUploadOrchestrator};
#[cfg(feature = "shared-sessions")]
pub use redis_sessions::{RedisChunkSessionStore, RedisMultipartSessionStore};
pub use registration::{
    LedgerRegistrar, RegistrationPayload, RegistrationReceipt, UploadRegistrar,
};
pub use sessions::{
    ChunkSessionStore, ChunkStoreOutcome, ChunkSubmission, ExpiredUpload,
    InMemoryChunkSessionStore, InMemoryMultipartSessionStore, MultipartSessionStore, MultipartUploadState,
    ReassembledUpload, UploadedPart,
};

/// Highest part number accepted by S3-compatible stores.
pub const MAX_PART_NUMBER: u32 = 10_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_total_chunks: u32,
    /// Incomplete sessions are discarded after this long.
    pub session_ttl_secs: u64,
    /// How long a consumed chunk session id keeps answering "complete".
    pub tombstone_ttl_secs: u64,
    pub object_prefix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_total_chunks: 10_000,
            session_ttl_secs: 24 * 60 * 60,
            tombstone_ttl_secs: 60 * 60,
            object_prefix: "uploads".into(),
        }
    }
}

/// Where a finished upload is registered. Chunk sessions carry this as their
/// JSON metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub job_id: JobId,
    pub owner_id: OwnerId,
    #[serde(flatten)]
    pub descriptor: FileDescriptor,
}

impl UploadTarget {
    pub fn from_metadata(metadata: &serde_json::Value) -> Result<Self> {
        let target: UploadTarget =
            serde_json::from_value(metadata.clone()).map_err(|e| {
                KilnError::InvalidInput(format!(
                    "upload metadata must name jobId, ownerId and filename: {e}"
                ))
            })?;
        target.descriptor.validate()?;
        Ok(target)
    }

    /// Object key for the finished upload, stable per target.
    pub fn object_key(&self, prefix: &str) -> String {
        artifact_key(prefix, &self.owner_id, &self.job_id, &self.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn target_parses_from_chunk_metadata() {
        let target = UploadTarget::from_metadata(&json!({
            "jobId": "train-1",
            "ownerId": "o1",
            "filename": "lora.safetensors",
            "subfolder": "loras/",
        }))
        .unwrap();
        assert_eq!(
            target.object_key("uploads"),
            "uploads/o1/train-1/loras/lora.safetensors"
        );

        assert!(UploadTarget::from_metadata(&json!({"jobId": "x"})).is_err());
    }
}
