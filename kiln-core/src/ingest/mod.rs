//! Provider callback ingestion.
//!
//! Webhook deliveries and reconciler polls both end up in
//! [`CallbackIngestor::ingest`]. Outputs are persisted before the job is
//! allowed to complete, so a failed persist leaves the job in its last good
//! state and the provider (or the reconciler) can redeliver.

pub mod reconciler;

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use tracing::{debug, info, instrument, warn};

use crate::{
    artifacts::{ArtifactStoreAdapter, PersistRequest},
    error::{KilnError, Result},
    ledger::JobLedger,
    provider::{ProviderClient, ProviderEvent, ProviderOutput},
    retry::RetryPolicy,
    storage::{ObjectStore, artifact_key},
    types::{GenerationJob, StorageHints},
};

pub use reconciler::{ReconcileOutcome, ReconcileSummary, Reconciler, ReconcilerConfig};

pub struct CallbackIngestor {
    ledger: Arc<JobLedger>,
    artifacts: Arc<ArtifactStoreAdapter>,
    objects: Arc<dyn ObjectStore>,
    provider: Arc<dyn ProviderClient>,
    download_retry: RetryPolicy,
    store_retry: RetryPolicy,
    object_prefix: String,
}

impl std::fmt::Debug for CallbackIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackIngestor")
            .field("provider", &self.provider)
            .field("object_prefix", &self.object_prefix)
            .finish()
    }
}

impl CallbackIngestor {
    pub fn new(
        ledger: Arc<JobLedger>,
        artifacts: Arc<ArtifactStoreAdapter>,
        objects: Arc<dyn ObjectStore>,
        provider: Arc<dyn ProviderClient>,
        download_retry: RetryPolicy,
        store_retry: RetryPolicy,
        object_prefix: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            artifacts,
            objects,
            provider,
            download_retry,
            store_retry,
            object_prefix: object_prefix.into(),
        }
    }

    pub fn ledger(&self) -> &Arc<JobLedger> {
        &self.ledger
    }

    /// Applies one provider event. Redelivery of the same event is harmless.
    #[instrument(skip_all, fields(job_id = %event.job_id, status = ?event.patch.status))]
    pub async fn ingest(&self, event: ProviderEvent) -> Result<GenerationJob> {
        event.patch.validate()?;
        let job = self.ledger.get(&event.job_id).await?;
        let ProviderEvent {
            job_id,
            mut patch,
            outputs,
        } = event;

        if job.is_terminal() {
            if !outputs.is_empty() {
                debug!(outputs = outputs.len(), "job already terminal, skipping outputs");
            }
            return self.ledger.apply_update(&job_id, patch).await;
        }

        if !outputs.is_empty() {
            let mut refs = patch
                .result_refs
                .take()
                .unwrap_or_else(|| job.result_refs.clone());
            for output in &outputs {
                let artifact_id = self.persist_output(&job, output).await?;
                if !refs.contains(&artifact_id) {
                    refs.push(artifact_id);
                }
            }
            info!(persisted = outputs.len(), "provider outputs persisted");
            patch.result_refs = Some(refs);
        }

        self.ledger.apply_update(&job_id, patch).await
    }

    async fn persist_output(&self, job: &GenerationJob, output: &ProviderOutput) -> Result<String> {
        output.descriptor.validate()?;
        let bytes = match (&output.data, &output.url) {
            (Some(data), _) => Some(STANDARD.decode(data).map_err(|e| {
                KilnError::InvalidInput(format!(
                    "output {} carries invalid base64: {e}",
                    output.descriptor.filename
                ))
            })?),
            (None, Some(url)) => {
                let provider = &self.provider;
                Some(
                    self.download_retry
                        .run("provider output download", || provider.fetch_output(url))
                        .await?,
                )
            }
            (None, None) => None,
        };

        let mut hints = output.hints.clone();
        if hints.object_key.is_none()
            && let Some(bytes) = &bytes
            && bytes.len() > self.artifacts.max_inline_bytes()
        {
            hints = self.offload(job, output, bytes).await?;
        }

        let persisted = self
            .artifacts
            .persist(PersistRequest {
                owner: &job.owner_id,
                job_id: &job.job_id,
                descriptor: &output.descriptor,
                bytes: bytes.as_deref(),
                hints,
                metadata: output.metadata.clone(),
            })
            .await?;
        debug!(
            artifact = %persisted.artifact.id,
            disposition = ?persisted.disposition,
            "output persisted"
        );
        Ok(persisted.artifact.id.to_string())
    }

    /// Writes an output too large for inline storage to the object store.
    async fn offload(
        &self,
        job: &GenerationJob,
        output: &ProviderOutput,
        bytes: &[u8],
    ) -> Result<StorageHints> {
        let key = artifact_key(
            &self.object_prefix,
            &job.owner_id,
            &job.job_id,
            &output.descriptor,
        );
        warn!(
            key = %key,
            bytes = bytes.len(),
            "output exceeds inline cap, writing to object store"
        );
        let objects = &self.objects;
        let stored = self
            .store_retry
            .run("object store put", || objects.put(&key, bytes))
            .await?;
        Ok(StorageHints {
            object_key: Some(stored.key),
            external_path: output.hints.external_path.clone(),
            byte_size: Some(stored.byte_size),
        })
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use serde_json::json;

    use super::*;
    use crate::{
        artifacts::ArtifactConfig,
        ledger::LedgerConfig,
        persistence::{InMemoryArtifactRepository, InMemoryJobRepository},
        provider::MockProviderClient,
        realtime::FanoutHub,
        storage::CacacheObjectStore,
        types::{JobCategory, JobId, JobPatch, JobStatus, OwnerId, StorageTier},
    };

    struct Harness {
        ingestor: CallbackIngestor,
        ledger: Arc<JobLedger>,
        artifacts: Arc<ArtifactStoreAdapter>,
        _dir: tempfile::TempDir,
    }

    fn harness(provider: MockProviderClient, max_inline_bytes: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(JobLedger::new(
            Arc::new(InMemoryJobRepository::new()),
            FanoutHub::default(),
            LedgerConfig::default(),
        ));
        let artifacts = Arc::new(ArtifactStoreAdapter::new(
            Arc::new(InMemoryArtifactRepository::new()),
            ArtifactConfig { max_inline_bytes },
        ));
        let fast = RetryPolicy {
            backoff_base_ms: 1,
            backoff_max_ms: 1,
            ..RetryPolicy::default()
        };
        let ingestor = CallbackIngestor::new(
            ledger.clone(),
            artifacts.clone(),
            Arc::new(CacacheObjectStore::new(dir.path())),
            Arc::new(provider),
            fast.clone(),
            fast,
            "generated",
        );
        Harness {
            ingestor,
            ledger,
            artifacts,
            _dir: dir,
        }
    }

    async fn seed(ledger: &JobLedger) -> JobId {
        let owner = OwnerId::parse("o1").unwrap();
        let job_id = JobId::parse("j1").unwrap();
        ledger
            .upsert(
                &owner,
                &job_id,
                Some(JobCategory::TextToImage),
                JobPatch::default().with_status(JobStatus::Processing),
            )
            .await
            .unwrap();
        job_id
    }

    fn event(value: serde_json::Value) -> ProviderEvent {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn completion_persists_outputs_before_completing() {
        let mut provider = MockProviderClient::new();
        provider
            .expect_fetch_output()
            .with(eq("view/b.png"))
            .times(1)
            .returning(|_| Ok(b"remote".to_vec()));
        let h = harness(provider, 1024);
        let job_id = seed(&h.ledger).await;

        let job = h
            .ingestor
            .ingest(event(json!({
                "jobId": "j1",
                "status": "COMPLETED",
                "outputs": [
                    {"filename": "a.png", "data": "aGk="},
                    {"filename": "b.png", "url": "view/b.png"},
                    {"filename": "c.mp4", "objectKey": "gen/c.mp4", "byteSize": 9},
                ],
            })))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result_refs.len(), 3);
        let refs = h.artifacts.list_for_job(&job_id).await.unwrap();
        assert_eq!(refs.len(), 3);
        let video = refs.iter().find(|a| a.filename == "c.mp4").unwrap();
        assert_eq!(video.storage, StorageTier::Object);
    }

    #[tokio::test]
    async fn redelivery_after_completion_is_idempotent() {
        let h = harness(MockProviderClient::new(), 1024);
        seed(&h.ledger).await;
        let body = json!({
            "jobId": "j1",
            "status": "COMPLETED",
            "outputs": [{"filename": "a.png", "data": "aGk="}],
        });

        let first = h.ingestor.ingest(event(body.clone())).await.unwrap();
        let second = h.ingestor.ingest(event(body)).await.unwrap();
        assert_eq!(first.result_refs, second.result_refs);
        assert_eq!(second.completed_at, first.completed_at);

        let late = h
            .ingestor
            .ingest(event(json!({"jobId": "j1", "status": "PROCESSING", "progress": 40})))
            .await
            .unwrap();
        assert_eq!(late.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn failed_download_leaves_job_unfinished() {
        let mut provider = MockProviderClient::new();
        provider
            .expect_fetch_output()
            .times(3)
            .returning(|_| Err(KilnError::upstream("download", "connection reset")));
        let h = harness(provider, 1024);
        let job_id = seed(&h.ledger).await;

        let err = h
            .ingestor
            .ingest(event(json!({
                "jobId": "j1",
                "status": "COMPLETED",
                "outputs": [{"filename": "b.png", "url": "view/b.png"}],
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Upstream { .. }));
        let job = h.ledger.get(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn oversized_output_goes_to_object_store() {
        let h = harness(MockProviderClient::new(), 2);
        let job_id = seed(&h.ledger).await;
        h.ingestor
            .ingest(event(json!({
                "jobId": "j1",
                "status": "COMPLETED",
                "outputs": [{"filename": "a.png", "data": "aGVsbG8="}],
            })))
            .await
            .unwrap();
        let refs = h.artifacts.list_for_job(&job_id).await.unwrap();
        assert_eq!(refs[0].storage, StorageTier::Object);
        assert_eq!(refs[0].object_key.as_deref(), Some("generated/o1/j1/a.png"));
        assert_eq!(refs[0].byte_size, 5);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let h = harness(MockProviderClient::new(), 1024);
        let err = h
            .ingestor
            .ingest(event(json!({"jobId": "nope", "status": "PROCESSING"})))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::NotFound { .. }));
    }
}
