use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use super::UploadTarget;
use crate::{
    artifacts::{ArtifactStoreAdapter, PersistRequest},
    error::Result,
    ledger::JobLedger,
    retry::RetryPolicy,
    storage::{ObjectRef, ObjectStore},
    types::{ArtifactRef, GenerationJob, JobPatch, JobStatus, SessionId, StorageHints},
};

/// Bytes handed over by a finished upload.
pub enum RegistrationPayload {
    /// Reassembled in memory; still has to reach the object store.
    Bytes(Vec<u8>),
    /// Already written by a multipart completion.
    Stored(ObjectRef),
}

impl fmt::Debug for RegistrationPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationPayload::Bytes(bytes) => {
                f.debug_tuple("Bytes").field(&bytes.len()).finish()
            }
            RegistrationPayload::Stored(object) => {
                f.debug_tuple("Stored").field(object).finish()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationReceipt {
    pub artifact: ArtifactRef,
    pub job: GenerationJob,
}

/// Turns a finished upload into a persisted artifact and a ledger update.
#[async_trait]
pub trait UploadRegistrar: Send + Sync + fmt::Debug {
    async fn register(
        &self,
        session_id: &SessionId,
        target: &UploadTarget,
        payload: RegistrationPayload,
    ) -> Result<RegistrationReceipt>;
}

#[derive(Debug)]
pub struct LedgerRegistrar {
    ledger: Arc<JobLedger>,
    artifacts: Arc<ArtifactStoreAdapter>,
    objects: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    object_prefix: String,
}

impl LedgerRegistrar {
    pub fn new(
        ledger: Arc<JobLedger>,
        artifacts: Arc<ArtifactStoreAdapter>,
        objects: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
        object_prefix: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            artifacts,
            objects,
            retry,
            object_prefix: object_prefix.into(),
        }
    }
}

#[async_trait]
impl UploadRegistrar for LedgerRegistrar {
    async fn register(
        &self,
        session_id: &SessionId,
        target: &UploadTarget,
        payload: RegistrationPayload,
    ) -> Result<RegistrationReceipt> {
        // The job must exist before anything is written.
        let job = self.ledger.get_owned(&target.owner_id, &target.job_id).await?;

        let object = match payload {
            RegistrationPayload::Stored(object) => object,
            RegistrationPayload::Bytes(bytes) => {
                let key = target.object_key(&self.object_prefix);
                let objects = &self.objects;
                self.retry
                    .run("object store put", || objects.put(&key, &bytes))
                    .await?
            }
        };

        let persisted = self
            .artifacts
            .persist(PersistRequest {
                owner: &target.owner_id,
                job_id: &target.job_id,
                descriptor: &target.descriptor,
                bytes: None,
                hints: StorageHints::object(object.key.clone(), object.byte_size),
                metadata: Some(serde_json::json!({
                    "etag": object.etag,
                    "uploadSession": session_id.as_str(),
                })),
            })
            .await?;

        let mut refs = job.result_refs.clone();
        let artifact_id = persisted.artifact.id.to_string();
        if !refs.contains(&artifact_id) {
            refs.push(artifact_id);
        }
        let job = self
            .ledger
            .apply_update(
                &target.job_id,
                JobPatch::default()
                    .with_status(JobStatus::Completed)
                    .with_progress(100)
                    .with_message("upload registered")
                    .with_result_refs(refs),
            )
            .await?;

        info!(
            session = %session_id,
            job_id = %target.job_id,
            key = %object.key,
            bytes = object.byte_size,
            "upload registered"
        );
        Ok(RegistrationReceipt {
            artifact: persisted.artifact,
            job,
        })
    }
}
