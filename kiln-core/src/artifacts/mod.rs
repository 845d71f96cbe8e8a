//! Artifact persistence with identity dedup and inline to object upgrades.

pub mod probe;

use std::{fmt, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    error::{KilnError, Result},
    persistence::{ArtifactRepository, InsertOutcome},
    storage::ObjectStore,
    types::{
        Artifact, ArtifactId, ArtifactLocation, ArtifactRef, FileDescriptor, JobId,
        OwnerId, ProbedMetadata, StorageHints,
    },
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Largest payload kept inline in the metadata store.
    pub max_inline_bytes: usize,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            max_inline_bytes: 16 * 1024 * 1024,
        }
    }
}

/// What [`ArtifactStoreAdapter::persist`] did with a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistDisposition {
    Created,
    /// An inline row now references the object store instead.
    Upgraded,
    /// The row already referenced the object store; nothing changed.
    AlreadyOptimized,
    /// An inline row existed and no reference was offered; nothing changed.
    Existing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistOutcome {
    pub artifact: ArtifactRef,
    pub disposition: PersistDisposition,
}

#[derive(Debug)]
pub struct PersistRequest<'a> {
    pub owner: &'a OwnerId,
    pub job_id: &'a JobId,
    pub descriptor: &'a FileDescriptor,
    /// Payload in hand, if any. Used for probing and for inline storage.
    pub bytes: Option<&'a [u8]>,
    pub hints: StorageHints,
    pub metadata: Option<Value>,
}

pub struct ArtifactStoreAdapter {
    repo: Arc<dyn ArtifactRepository>,
    config: ArtifactConfig,
}

impl fmt::Debug for ArtifactStoreAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStoreAdapter")
            .field("repo", &self.repo)
            .field("max_inline_bytes", &self.config.max_inline_bytes)
            .finish()
    }
}

impl ArtifactStoreAdapter {
    pub fn new(repo: Arc<dyn ArtifactRepository>, config: ArtifactConfig) -> Self {
        Self { repo, config }
    }

    pub fn max_inline_bytes(&self) -> usize {
        self.config.max_inline_bytes
    }

    /// Stores or references one artifact. Repeated calls with the same
    /// identity never create a second row. Never touches the object store:
    /// a hint means the bytes are already there.
    pub async fn persist(&self, request: PersistRequest<'_>) -> Result<PersistOutcome> {
        request.descriptor.validate()?;
        let job_id = request.job_id;
        let descriptor = request.descriptor;
        let failed = |err: KilnError| match err {
            KilnError::InvalidInput(_) | KilnError::Persistence { .. } => err,
            other => KilnError::Persistence {
                job_id: job_id.to_string(),
                filename: descriptor.filename.clone(),
                message: other.to_string(),
            },
        };

        let probed = probe::probe(&descriptor.filename, request.bytes);
        let existing = self
            .repo
            .find_by_identity(job_id, descriptor)
            .await
            .map_err(failed)?;
        if let Some(existing) = existing {
            return self
                .settle_existing(existing, &request.hints, &probed)
                .await
                .map_err(failed);
        }

        let (location, byte_size) = match &request.hints.object_key {
            Some(key) => (
                ArtifactLocation::Object {
                    key: key.clone(),
                    external_path: request.hints.external_path.clone(),
                },
                request
                    .hints
                    .byte_size
                    .or(request.bytes.map(|b| b.len() as u64))
                    .unwrap_or_default(),
            ),
            None => {
                let bytes = request.bytes.ok_or_else(|| {
                    KilnError::InvalidInput(format!(
                        "{} has neither bytes nor an objectKey",
                        descriptor.filename
                    ))
                })?;
                if bytes.len() > self.config.max_inline_bytes {
                    return Err(failed(KilnError::InvalidInput(format!(
                        "{} is {} bytes; inline storage is capped at {}",
                        descriptor.filename,
                        bytes.len(),
                        self.config.max_inline_bytes
                    ))));
                }
                (ArtifactLocation::Inline(bytes.to_vec()), bytes.len() as u64)
            }
        };

        let artifact = Artifact {
            id: ArtifactId::new(),
            job_id: job_id.clone(),
            owner_id: request.owner.clone(),
            descriptor: descriptor.clone(),
            location,
            byte_size,
            format: probed.format.clone(),
            width: probed.width,
            height: probed.height,
            metadata: request.metadata,
            usage_count: 0,
            created_at: Utc::now(),
        };

        match self.repo.insert(artifact).await.map_err(failed)? {
            InsertOutcome::Inserted(artifact) => {
                info!(
                    job_id = %job_id,
                    filename = %descriptor.filename,
                    inline = artifact.location.is_inline(),
                    bytes = artifact.byte_size,
                    "artifact created"
                );
                Ok(PersistOutcome {
                    artifact: artifact.to_ref(),
                    disposition: PersistDisposition::Created,
                })
            }
            // Lost a race with a concurrent persist of the same identity.
            InsertOutcome::Existing(existing) => self
                .settle_existing(existing, &request.hints, &probed)
                .await
                .map_err(failed),
        }
    }

    async fn settle_existing(
        &self,
        existing: Artifact,
        hints: &StorageHints,
        probed: &ProbedMetadata,
    ) -> Result<PersistOutcome> {
        if !existing.location.is_inline() {
            debug!(artifact = %existing.id, "artifact already references object store");
            return Ok(PersistOutcome {
                artifact: existing.to_ref(),
                disposition: PersistDisposition::AlreadyOptimized,
            });
        }
        let Some(key) = &hints.object_key else {
            return Ok(PersistOutcome {
                artifact: existing.to_ref(),
                disposition: PersistDisposition::Existing,
            });
        };

        let byte_size = hints.byte_size.unwrap_or(existing.byte_size);
        let upgraded = self
            .repo
            .promote_to_object(
                existing.id,
                ArtifactLocation::Object {
                    key: key.clone(),
                    external_path: hints.external_path.clone(),
                },
                byte_size,
                probed,
            )
            .await?;
        info!(artifact = %upgraded.id, key = %key, "artifact moved to object store");
        Ok(PersistOutcome {
            artifact: upgraded.to_ref(),
            disposition: PersistDisposition::Upgraded,
        })
    }

    pub async fn get(&self, id: ArtifactId) -> Result<Artifact> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| KilnError::not_found("artifact", id.to_string()))
    }

    /// Loads the bytes of one of `job_id`'s artifacts and counts the read.
    pub async fn open(
        &self,
        job_id: &JobId,
        id: ArtifactId,
        objects: &dyn ObjectStore,
    ) -> Result<(ArtifactRef, Vec<u8>)> {
        let artifact = self.get(id).await?;
        if &artifact.job_id != job_id {
            return Err(KilnError::not_found("artifact", id.to_string()));
        }
        let bytes = match &artifact.location {
            ArtifactLocation::Inline(data) => data.clone(),
            ArtifactLocation::Object { key, .. } => objects.get(key).await?,
        };
        self.repo.record_use(id).await?;
        debug!(artifact = %id, bytes = bytes.len(), "artifact read");
        Ok((artifact.to_ref(), bytes))
    }

    pub async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<ArtifactRef>> {
        Ok(self
            .repo
            .list_for_job(job_id)
            .await?
            .iter()
            .map(Artifact::to_ref)
            .collect())
    }

    pub async fn delete_for_job(&self, job_id: &JobId) -> Result<u64> {
        self.repo.delete_for_job(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        persistence::InMemoryArtifactRepository, storage::CacacheObjectStore,
        types::StorageTier,
    };

    fn adapter() -> ArtifactStoreAdapter {
        ArtifactStoreAdapter::new(
            Arc::new(InMemoryArtifactRepository::new()),
            ArtifactConfig::default(),
        )
    }

    struct Fixture {
        owner: OwnerId,
        job_id: JobId,
        descriptor: FileDescriptor,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                owner: OwnerId::parse("o1").unwrap(),
                job_id: JobId::parse("j1").unwrap(),
                descriptor: FileDescriptor::output("image.png"),
            }
        }

        fn request<'a>(
            &'a self,
            bytes: Option<&'a [u8]>,
            hints: StorageHints,
        ) -> PersistRequest<'a> {
            PersistRequest {
                owner: &self.owner,
                job_id: &self.job_id,
                descriptor: &self.descriptor,
                bytes,
                hints,
                metadata: None,
            }
        }
    }

    #[tokio::test]
    async fn inline_then_hint_upgrades_then_is_already_optimized() {
        let adapter = adapter();
        let fx = Fixture::new();

        let first = adapter
            .persist(fx.request(Some(b"pixels"), StorageHints::default()))
            .await
            .unwrap();
        assert_eq!(first.disposition, PersistDisposition::Created);
        assert_eq!(first.artifact.storage, StorageTier::Inline);

        let second = adapter
            .persist(fx.request(None, StorageHints::object("objects/image.png", 6)))
            .await
            .unwrap();
        assert_eq!(second.disposition, PersistDisposition::Upgraded);
        assert_eq!(second.artifact.id, first.artifact.id);
        assert_eq!(second.artifact.object_key.as_deref(), Some("objects/image.png"));

        let third = adapter
            .persist(fx.request(Some(b"pixels"), StorageHints::default()))
            .await
            .unwrap();
        assert_eq!(third.disposition, PersistDisposition::AlreadyOptimized);

        let rows = adapter.list_for_job(&fx.job_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        let stored = adapter.get(first.artifact.id).await.unwrap();
        assert!(!stored.location.is_inline());
    }

    #[tokio::test]
    async fn repeated_inline_persist_keeps_one_row() {
        let adapter = adapter();
        let fx = Fixture::new();
        for _ in 0..3 {
            adapter
                .persist(fx.request(Some(b"abc"), StorageHints::default()))
                .await
                .unwrap();
        }
        let again = adapter
            .persist(fx.request(Some(b"abc"), StorageHints::default()))
            .await
            .unwrap();
        assert_eq!(again.disposition, PersistDisposition::Existing);
        assert_eq!(adapter.list_for_job(&fx.job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hint_only_persist_creates_object_row() {
        let adapter = adapter();
        let fx = Fixture::new();
        let outcome = adapter
            .persist(fx.request(None, StorageHints::object("objects/k", 1024)))
            .await
            .unwrap();
        assert_eq!(outcome.disposition, PersistDisposition::Created);
        assert_eq!(outcome.artifact.byte_size, 1024);
        assert_eq!(outcome.artifact.format.as_deref(), Some("png"));
    }

    #[tokio::test]
    async fn open_reads_both_tiers_and_counts_uses() {
        let adapter = adapter();
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let objects = CacacheObjectStore::new(dir.path());
        objects.put("objects/big.png", b"object bytes").await.unwrap();

        let inline = adapter
            .persist(fx.request(Some(b"pixels"), StorageHints::default()))
            .await
            .unwrap();
        let big = Fixture {
            descriptor: FileDescriptor::output("big.png"),
            ..Fixture::new()
        };
        let object = adapter
            .persist(big.request(None, StorageHints::object("objects/big.png", 12)))
            .await
            .unwrap();

        let (_, bytes) = adapter
            .open(&fx.job_id, inline.artifact.id, &objects)
            .await
            .unwrap();
        assert_eq!(bytes, b"pixels");
        let (artifact, bytes) = adapter
            .open(&fx.job_id, object.artifact.id, &objects)
            .await
            .unwrap();
        assert_eq!(bytes, b"object bytes");
        assert_eq!(artifact.usage_count, 0);
        adapter
            .open(&fx.job_id, object.artifact.id, &objects)
            .await
            .unwrap();
        assert_eq!(adapter.get(object.artifact.id).await.unwrap().usage_count, 2);

        let other_job = JobId::parse("j2").unwrap();
        assert!(matches!(
            adapter.open(&other_job, inline.artifact.id, &objects).await,
            Err(KilnError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn nothing_to_store_is_invalid_input() {
        let adapter = adapter();
        let fx = Fixture::new();
        let result = adapter.persist(fx.request(None, StorageHints::default())).await;
        assert!(matches!(result, Err(KilnError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn oversized_inline_payload_is_rejected() {
        let adapter = ArtifactStoreAdapter::new(
            Arc::new(InMemoryArtifactRepository::new()),
            ArtifactConfig { max_inline_bytes: 4 },
        );
        let fx = Fixture::new();
        let result = adapter
            .persist(fx.request(Some(b"too large"), StorageHints::default()))
            .await;
        assert!(result.is_err());
        assert!(adapter.list_for_job(&fx.job_id).await.unwrap().is_empty());
    }
}
