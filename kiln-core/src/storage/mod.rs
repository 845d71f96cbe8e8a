//! Object store seam used for large artifacts and multipart uploads.

pub mod cacache_store;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::Result,
    types::{FileDescriptor, JobId, OwnerId},
};

pub use cacache_store::CacacheObjectStore;

/// Result of a completed write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub key: String,
    pub byte_size: u64,
    pub etag: String,
}

/// One entry of a multipart completion manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// S3-shaped object storage. Keys are opaque strings.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<ObjectRef>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Starts a multipart upload and returns its upload id.
    async fn create_multipart(&self, key: &str) -> Result<String>;

    /// Stores one part and returns its etag. Re-uploading a part number
    /// replaces the earlier bytes.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        bytes: &[u8],
    ) -> Result<String>;

    /// Concatenates the parts in manifest order into the final object.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectRef>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// Object key for an artifact: `prefix/owner/job/[subfolder/]filename`.
pub fn artifact_key(
    prefix: &str,
    owner: &OwnerId,
    job_id: &JobId,
    descriptor: &FileDescriptor,
) -> String {
    let mut key = format!("{}/{}/{}/", prefix.trim_end_matches('/'), owner, job_id);
    let subfolder = descriptor.subfolder.trim_matches('/');
    if !subfolder.is_empty() {
        key.push_str(subfolder);
        key.push('/');
    }
    key.push_str(&descriptor.filename);
    key
}

/// Hex-encoded SHA-256 of `bytes`, used as the etag.
pub fn etag_for(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
