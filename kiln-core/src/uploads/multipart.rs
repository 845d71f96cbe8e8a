use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    MAX_PART_NUMBER, RegistrationPayload, RegistrationReceipt, UploadRegistrar,
    UploadTarget,
    sessions::{MultipartSessionStore, MultipartUploadState, UploadedPart},
};
use crate::{
    error::{KilnError, Result},
    retry::with_timeout,
    storage::{CompletedPart, ObjectRef, ObjectStore},
    types::SessionId,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartStart {
    pub session_id: SessionId,
    pub upload_id: String,
    pub object_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartCompletion {
    pub object: ObjectRef,
    pub registration: RegistrationReceipt,
}

/// Builds the completion manifest: parts sorted ascending, exactly
/// `1..=total_parts`.
pub fn completion_manifest(
    session_id: &SessionId,
    parts: &[UploadedPart],
    total_parts: u32,
) -> Result<Vec<CompletedPart>> {
    if total_parts == 0 || total_parts > MAX_PART_NUMBER {
        return Err(KilnError::InvalidInput(format!(
            "totalParts must be within 1..={MAX_PART_NUMBER}"
        )));
    }
    let by_number: BTreeMap<u32, &str> = parts
        .iter()
        .map(|part| (part.part_number, part.etag.as_str()))
        .collect();
    if let Some((extra, _)) = by_number.range(total_parts + 1..).next() {
        return Err(KilnError::InvalidInput(format!(
            "part {extra} exceeds totalParts {total_parts}"
        )));
    }
    let missing: Vec<u32> = (1..=total_parts)
        .filter(|n| !by_number.contains_key(n))
        .collect();
    if !missing.is_empty() {
        return Err(KilnError::IncompleteParts {
            session_id: session_id.to_string(),
            expected: total_parts,
            received: by_number.len() as u32,
            deficit: missing.len() as u32,
            missing,
        });
    }
    Ok(by_number
        .into_iter()
        .map(|(part_number, etag)| CompletedPart {
            part_number,
            etag: etag.to_string(),
        })
        .collect())
}

/// Drives object store multipart uploads keyed by a client session id.
#[derive(Debug)]
pub struct MultipartUploadOrchestrator {
    sessions: Arc<dyn MultipartSessionStore>,
    objects: Arc<dyn ObjectStore>,
    registrar: Arc<dyn UploadRegistrar>,
    object_prefix: String,
    call_timeout: Duration,
}

impl MultipartUploadOrchestrator {
    pub fn new(
        sessions: Arc<dyn MultipartSessionStore>,
        objects: Arc<dyn ObjectStore>,
        registrar: Arc<dyn UploadRegistrar>,
        object_prefix: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            objects,
            registrar,
            object_prefix: object_prefix.into(),
            call_timeout,
        }
    }

    #[instrument(skip_all, fields(job_id = %target.job_id))]
    pub async fn start(
        &self,
        session_id: Option<SessionId>,
        target: UploadTarget,
    ) -> Result<MultipartStart> {
        target.descriptor.validate()?;
        self.reap_expired().await?;
        let session_id = match session_id {
            Some(id) => id,
            None => SessionId::parse(Uuid::new_v4().to_string())?,
        };
        if self.sessions.get(&session_id).await?.is_some() {
            return Err(KilnError::InvalidInput(format!(
                "multipart session {session_id} already exists"
            )));
        }

        let object_key = target.object_key(&self.object_prefix);
        let upload_id = with_timeout(
            "create multipart upload",
            self.call_timeout,
            self.objects.create_multipart(&object_key),
        )
        .await?;

        let state = MultipartUploadState {
            session_id: session_id.clone(),
            upload_id: upload_id.clone(),
            object_key: object_key.clone(),
            target,
            parts: Vec::new(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.sessions.insert(state).await {
            // Lost a race for the session id; do not leak the remote upload.
            if let Err(abort) = self.objects.abort_multipart(&object_key, &upload_id).await {
                warn!(upload_id, error = %abort, "failed to abort orphaned upload");
            }
            return Err(err);
        }
        info!(session = %session_id, upload_id, key = %object_key, "multipart upload started");
        Ok(MultipartStart {
            session_id,
            upload_id,
            object_key,
        })
    }

    async fn session(&self, session_id: &SessionId) -> Result<MultipartUploadState> {
        self.reap_expired().await?;
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| KilnError::not_found("multipart session", session_id.as_str()))
    }

    /// Stores one part and returns its etag.
    #[instrument(skip_all, fields(session = %session_id, part = part_number))]
    pub async fn upload_part(
        &self,
        session_id: &SessionId,
        part_number: u32,
        bytes: &[u8],
    ) -> Result<String> {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(KilnError::InvalidInput(format!(
                "partNumber must be within 1..={MAX_PART_NUMBER}, got {part_number}"
            )));
        }
        let state = self.session(session_id).await?;
        let etag = with_timeout(
            "upload part",
            self.call_timeout,
            self.objects
                .upload_part(&state.object_key, &state.upload_id, part_number, bytes),
        )
        .await?;
        self.sessions
            .record_part(
                session_id,
                UploadedPart {
                    part_number,
                    etag: etag.clone(),
                },
            )
            .await?;
        debug!(bytes = bytes.len(), "part stored");
        Ok(etag)
    }

    /// Finishes the upload once every part in `1..=total_parts` is present.
    /// On a deficit nothing changes and the session stays open.
    #[instrument(skip_all, fields(session = %session_id, total_parts))]
    pub async fn complete(
        &self,
        session_id: &SessionId,
        total_parts: u32,
    ) -> Result<MultipartCompletion> {
        let state = self.session(session_id).await?;
        let manifest = completion_manifest(session_id, &state.parts, total_parts)?;

        let object = with_timeout(
            "complete multipart upload",
            self.call_timeout,
            self.objects
                .complete_multipart(&state.object_key, &state.upload_id, &manifest),
        )
        .await?;
        self.sessions.remove(session_id).await?;
        info!(key = %object.key, bytes = object.byte_size, "multipart upload assembled");

        let registration = self
            .registrar
            .register(
                session_id,
                &state.target,
                RegistrationPayload::Stored(object.clone()),
            )
            .await
            .map_err(|err| {
                error!(error = %err, "assembled upload could not be registered");
                KilnError::ReassemblyFailed {
                    session_id: session_id.to_string(),
                    source: Box::new(err),
                }
            })?;
        Ok(MultipartCompletion {
            object,
            registration,
        })
    }

    /// Aborts the remote uploads of sessions that outlived their TTL and
    /// returns how many went.
    pub async fn reap_expired(&self) -> Result<usize> {
        let expired = self.sessions.take_expired().await?;
        for upload in &expired {
            let aborted = with_timeout(
                "abort multipart upload",
                self.call_timeout,
                self.objects
                    .abort_multipart(&upload.object_key, &upload.upload_id),
            )
            .await;
            match aborted {
                Ok(()) => info!(
                    session = %upload.session_id,
                    upload_id = %upload.upload_id,
                    "expired multipart upload aborted"
                ),
                Err(err) => warn!(
                    session = %upload.session_id,
                    upload_id = %upload.upload_id,
                    error = %err,
                    "failed to abort expired multipart upload"
                ),
            }
        }
        Ok(expired.len())
    }

    /// Discards the session and the remote upload. Unknown sessions are a no-op.
    #[instrument(skip_all, fields(session = %session_id))]
    pub async fn abort(&self, session_id: &SessionId) -> Result<()> {
        let Some(state) = self.sessions.remove(session_id).await? else {
            debug!("abort for unknown session");
            return Ok(());
        };
        with_timeout(
            "abort multipart upload",
            self.call_timeout,
            self.objects
                .abort_multipart(&state.object_key, &state.upload_id),
        )
        .await?;
        info!(upload_id = %state.upload_id, "multipart upload aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        storage::CacacheObjectStore,
        types::{
            ArtifactId, ArtifactKind, ArtifactRef, FileDescriptor, GenerationJob,
            JobCategory, JobId, OwnerId, StorageTier,
        },
        uploads::sessions::InMemoryMultipartSessionStore,
    };

    #[derive(Debug, Default)]
    struct RecordingRegistrar {
        objects: Mutex<Vec<ObjectRef>>,
    }

    #[async_trait]
    impl UploadRegistrar for RecordingRegistrar {
        async fn register(
            &self,
            _session_id: &SessionId,
            target: &UploadTarget,
            payload: RegistrationPayload,
        ) -> Result<RegistrationReceipt> {
            let RegistrationPayload::Stored(object) = payload else {
                panic!("multipart uploads hand over stored objects");
            };
            self.objects.lock().unwrap().push(object.clone());
            Ok(RegistrationReceipt {
                artifact: ArtifactRef {
                    id: ArtifactId::new(),
                    job_id: target.job_id.clone(),
                    filename: target.descriptor.filename.clone(),
                    subfolder: String::new(),
                    kind: ArtifactKind::Output,
                    storage: StorageTier::Object,
                    object_key: Some(object.key),
                    external_path: None,
                    byte_size: object.byte_size,
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

    fn target() -> UploadTarget {
        UploadTarget {
            job_id: JobId::parse("train-1").unwrap(),
            owner_id: OwnerId::parse("o1").unwrap(),
            descriptor: FileDescriptor::output("weights.bin"),
        }
    }

    fn part(part_number: u32) -> UploadedPart {
        UploadedPart {
            part_number,
            etag: format!("etag-{part_number}"),
        }
    }

    #[test]
    fn manifest_reports_deficit_and_missing_parts() {
        let session = SessionId::parse("m1").unwrap();
        let err = completion_manifest(&session, &[part(2), part(1)], 3).unwrap_err();
        let KilnError::IncompleteParts {
            deficit, missing, ..
        } = err
        else {
            panic!("expected IncompleteParts, got {err:?}");
        };
        assert_eq!(deficit, 1);
        assert_eq!(missing, vec![3]);

        let manifest = completion_manifest(&session, &[part(2), part(1)], 2).unwrap();
        let numbers: Vec<u32> = manifest.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2]);

        assert!(matches!(
            completion_manifest(&session, &[part(1), part(4)], 2),
            Err(KilnError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn complete_waits_for_every_part() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = Arc::new(RecordingRegistrar::default());
        let orchestrator = MultipartUploadOrchestrator::new(
            Arc::new(InMemoryMultipartSessionStore::default()),
            Arc::new(CacacheObjectStore::new(dir.path())),
            registrar.clone(),
            "uploads",
            Duration::from_secs(5),
        );

        let start = orchestrator
            .start(Some(SessionId::parse("m1").unwrap()), target())
            .await
            .unwrap();
        let session = start.session_id.clone();
        orchestrator.upload_part(&session, 2, b"-world").await.unwrap();
        orchestrator.upload_part(&session, 1, b"hello").await.unwrap();

        let err = orchestrator.complete(&session, 3).await.unwrap_err();
        assert!(matches!(err, KilnError::IncompleteParts { deficit: 1, .. }));

        let done = orchestrator.complete(&session, 2).await.unwrap();
        assert_eq!(done.object.byte_size, 11);
        assert_eq!(done.object.key, "uploads/o1/train-1/weights.bin");
        assert_eq!(registrar.objects.lock().unwrap().len(), 1);

        assert!(matches!(
            orchestrator.complete(&session, 2).await,
            Err(KilnError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn part_numbers_are_bounded_and_abort_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = MultipartUploadOrchestrator::new(
            Arc::new(InMemoryMultipartSessionStore::default()),
            Arc::new(CacacheObjectStore::new(dir.path())),
            Arc::new(RecordingRegistrar::default()),
            "uploads",
            Duration::from_secs(5),
        );
        let start = orchestrator.start(None, target()).await.unwrap();
        for bad in [0, MAX_PART_NUMBER + 1] {
            assert!(matches!(
                orchestrator.upload_part(&start.session_id, bad, b"x").await,
                Err(KilnError::InvalidInput(_))
            ));
        }
        orchestrator.abort(&start.session_id).await.unwrap();
        orchestrator.abort(&start.session_id).await.unwrap();
        assert!(matches!(
            orchestrator.upload_part(&start.session_id, 1, b"x").await,
            Err(KilnError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn abandoned_sessions_expire_and_release_remote_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(CacacheObjectStore::new(dir.path()));
        let orchestrator = MultipartUploadOrchestrator::new(
            Arc::new(InMemoryMultipartSessionStore::new(Duration::from_millis(50))),
            objects.clone(),
            Arc::new(RecordingRegistrar::default()),
            "uploads",
            Duration::from_secs(5),
        );
        let abandoned = orchestrator.start(None, target()).await.unwrap();
        orchestrator
            .upload_part(&abandoned.session_id, 1, b"stale")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(orchestrator.reap_expired().await.unwrap(), 1);
        assert_eq!(orchestrator.reap_expired().await.unwrap(), 0);

        assert!(matches!(
            orchestrator.upload_part(&abandoned.session_id, 2, b"late").await,
            Err(KilnError::NotFound { .. })
        ));
        assert!(
            objects
                .upload_part(&abandoned.object_key, &abandoned.upload_id, 2, b"late")
                .await
                .is_err()
        );
    }
}
