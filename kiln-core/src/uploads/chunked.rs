use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use super::{
    RegistrationPayload, RegistrationReceipt, UploadRegistrar, UploadTarget,
    sessions::{ChunkSessionStore, ChunkStoreOutcome, ChunkSubmission, validate_chunk},
};
use crate::{
    error::{KilnError, Result},
    types::SessionId,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkProgress {
    pub complete: bool,
    pub received: u32,
    pub total: u32,
    /// Present only on the call that finished the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<RegistrationReceipt>,
}

/// Accepts chunks in any order and registers the reassembled payload once.
#[derive(Debug)]
pub struct ChunkReassemblyService {
    store: Arc<dyn ChunkSessionStore>,
    registrar: Arc<dyn UploadRegistrar>,
    max_total_chunks: u32,
}

impl ChunkReassemblyService {
    pub fn new(
        store: Arc<dyn ChunkSessionStore>,
        registrar: Arc<dyn UploadRegistrar>,
        max_total_chunks: u32,
    ) -> Self {
        Self {
            store,
            registrar,
            max_total_chunks,
        }
    }

    #[instrument(skip_all, fields(session = %session_id, index = index, total = total_chunks))]
    pub async fn submit_chunk(
        &self,
        session_id: SessionId,
        index: u32,
        total_chunks: u32,
        bytes: Vec<u8>,
        metadata: Value,
    ) -> Result<ChunkProgress> {
        let submission = ChunkSubmission {
            session_id: session_id.clone(),
            index,
            total_chunks,
            bytes,
            metadata,
        };
        validate_chunk(&submission, self.max_total_chunks)?;
        // Reject unusable metadata before buffering anything.
        UploadTarget::from_metadata(&submission.metadata)?;

        match self.store.store_chunk(submission).await? {
            ChunkStoreOutcome::Pending { received, total } => {
                debug!(received, total, "chunk stored");
                Ok(ChunkProgress {
                    complete: false,
                    received,
                    total,
                    registration: None,
                })
            }
            ChunkStoreOutcome::AlreadyConsumed { total } => {
                debug!("late chunk for a finished session");
                Ok(ChunkProgress {
                    complete: true,
                    received: total,
                    total,
                    registration: None,
                })
            }
            ChunkStoreOutcome::Complete(upload) => {
                info!(bytes = upload.bytes.len(), "chunk session reassembled");
                let total = upload.total_chunks;
                let registered = match UploadTarget::from_metadata(&upload.metadata) {
                    Ok(target) => {
                        self.registrar
                            .register(
                                &session_id,
                                &target,
                                RegistrationPayload::Bytes(upload.bytes),
                            )
                            .await
                    }
                    Err(err) => Err(err),
                };
                match registered {
                    Ok(receipt) => Ok(ChunkProgress {
                        complete: true,
                        received: total,
                        total,
                        registration: Some(receipt),
                    }),
                    Err(err) => {
                        error!(error = %err, "reassembled upload could not be registered");
                        Err(KilnError::ReassemblyFailed {
                            session_id: session_id.to_string(),
                            source: Box::new(err),
                        })
                    }
                }
            }
        }
    }

    pub async fn progress(&self, session_id: &SessionId) -> Result<Option<(u32, u32)>> {
        self.store.progress(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::{
        types::{
            ArtifactId, ArtifactKind, ArtifactRef, GenerationJob, JobCategory, StorageTier,
        },
        uploads::sessions::InMemoryChunkSessionStore,
    };

    #[derive(Debug, Default)]
    struct RecordingRegistrar {
        payloads: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    #[async_trait]
    impl UploadRegistrar for RecordingRegistrar {
        async fn register(
            &self,
            _session_id: &SessionId,
            target: &UploadTarget,
            payload: RegistrationPayload,
        ) -> Result<RegistrationReceipt> {
            if self.fail {
                return Err(KilnError::ObjectStore("disk full".into()));
            }
            let RegistrationPayload::Bytes(bytes) = payload else {
                panic!("chunk uploads hand over bytes");
            };
            let size = bytes.len() as u64;
            self.payloads.lock().unwrap().push(bytes);
            Ok(RegistrationReceipt {
                artifact: ArtifactRef {
                    id: ArtifactId::new(),
                    job_id: target.job_id.clone(),
                    filename: target.descriptor.filename.clone(),
                    subfolder: String::new(),
                    kind: ArtifactKind::Output,
                    storage: StorageTier::Object,
                    object_key: Some("k".into()),
                    external_path: None,
                    byte_size: size,
                    format: None,
                    width: None,
                    height: None,
                    usage_count: 0,
                },
                job: GenerationJob::pending(
                    target.job_id.clone(),
                    target.owner_id.clone(),
                    JobCategory::ModelTraining,
                    Utc::now(),
                ),
            })
        }
    }

    fn metadata() -> Value {
        json!({"jobId": "train-1", "ownerId": "o1", "filename": "weights.bin"})
    }

    fn service(registrar: Arc<RecordingRegistrar>) -> ChunkReassemblyService {
        ChunkReassemblyService::new(
            Arc::new(InMemoryChunkSessionStore::default()),
            registrar,
            100,
        )
    }

    #[tokio::test]
    async fn out_of_order_chunks_register_once() {
        let registrar = Arc::new(RecordingRegistrar::default());
        let service = service(registrar.clone());
        let session = SessionId::parse("s1").unwrap();
        let chunks: [&[u8]; 5] = [b"00", b"11", b"22", b"33", b"44"];

        let mut last = None;
        for index in [2u32, 0, 4, 1, 3] {
            last = Some(
                service
                    .submit_chunk(
                        session.clone(),
                        index,
                        5,
                        chunks[index as usize].to_vec(),
                        metadata(),
                    )
                    .await
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        assert!(last.complete);
        assert!(last.registration.is_some());

        let late = service
            .submit_chunk(session.clone(), 1, 5, b"11".to_vec(), metadata())
            .await
            .unwrap();
        assert!(late.complete);
        assert!(late.registration.is_none());

        let payloads = registrar.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], b"0011223344");
    }

    #[tokio::test]
    async fn registration_failure_surfaces_and_session_is_gone() {
        let registrar = Arc::new(RecordingRegistrar {
            fail: true,
            ..Default::default()
        });
        let service = service(registrar);
        let session = SessionId::parse("s2").unwrap();
        service
            .submit_chunk(session.clone(), 0, 2, b"a".to_vec(), metadata())
            .await
            .unwrap();
        let result = service
            .submit_chunk(session.clone(), 1, 2, b"b".to_vec(), metadata())
            .await;
        assert!(matches!(result, Err(KilnError::ReassemblyFailed { .. })));
        assert_eq!(service.progress(&session).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_chunks_are_rejected_up_front() {
        let service = service(Arc::new(RecordingRegistrar::default()));
        let session = SessionId::parse("s3").unwrap();
        assert!(matches!(
            service
                .submit_chunk(session.clone(), 5, 5, vec![], metadata())
                .await,
            Err(KilnError::InvalidInput(_))
        ));
        assert!(matches!(
            service
                .submit_chunk(session.clone(), 0, 2, vec![], json!({"jobId": "x"}))
                .await,
            Err(KilnError::InvalidInput(_))
        ));
    }
}
