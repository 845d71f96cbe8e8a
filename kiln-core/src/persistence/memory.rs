use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};

use super::{ArtifactRepository, InsertOutcome, JobListFilter, JobRepository};
use crate::{
    error::{KilnError, Result},
    ledger::transitions::{ApplyOutcome, JobWrite, TRANSITIONS, decide},
    types::{
        Artifact, ArtifactId, ArtifactKind, ArtifactLocation, FileDescriptor,
        GenerationJob, JobCategory, JobId, OwnerId, ProbedMetadata,
    },
};

/// Process-local job table. The DashMap entry lock makes each write atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: DashMap<JobId, GenerationJob>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn get(&self, job_id: &JobId) -> Result<Option<GenerationJob>> {
        Ok(self.jobs.get(job_id).map(|job| job.clone()))
    }

    async fn apply(&self, write: JobWrite) -> Result<ApplyOutcome> {
        match self.jobs.entry(write.job_id.clone()) {
            Entry::Occupied(mut entry) => {
                let outcome = decide(&TRANSITIONS, Some(entry.get()), &write)?;
                if let ApplyOutcome::Updated(job) = &outcome {
                    entry.insert(job.clone());
                }
                Ok(outcome)
            }
            Entry::Vacant(entry) => {
                let outcome = decide(&TRANSITIONS, None, &write)?;
                if let ApplyOutcome::Created(job) = &outcome {
                    entry.insert(job.clone());
                }
                Ok(outcome)
            }
        }
    }

    async fn list_for_owner(
        &self,
        owner: &OwnerId,
        filter: &JobListFilter,
    ) -> Result<Vec<GenerationJob>> {
        let mut jobs: Vec<GenerationJob> = self
            .jobs
            .iter()
            .filter(|job| &job.owner_id == owner)
            .filter(|job| filter.category.is_none_or(|c| c == job.category))
            .filter(|job| {
                job.completed_at
                    .is_none_or(|completed| completed >= filter.completed_since)
            })
            .map(|job| job.clone())
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        jobs.truncate(filter.limit);
        Ok(jobs)
    }

    async fn list_stale_active(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>> {
        let mut jobs: Vec<GenerationJob> = self
            .jobs
            .iter()
            .filter(|job| {
                !job.is_terminal()
                    && job.provider_job_id.is_some()
                    && job.updated_at <= updated_before
            })
            .map(|job| job.clone())
            .collect();
        jobs.sort_by_key(|job| job.updated_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn delete(
        &self,
        owner: &OwnerId,
        job_id: &JobId,
    ) -> Result<Option<GenerationJob>> {
        Ok(self
            .jobs
            .remove_if(job_id, |_, job| &job.owner_id == owner)
            .map(|(_, job)| job))
    }

    async fn clear_terminal(
        &self,
        owner: &OwnerId,
        category: Option<JobCategory>,
    ) -> Result<Vec<JobId>> {
        let mut removed = Vec::new();
        self.jobs.retain(|job_id, job| {
            let matches = &job.owner_id == owner
                && job.is_terminal()
                && category.is_none_or(|c| c == job.category);
            if matches {
                removed.push(job_id.clone());
            }
            !matches
        });
        Ok(removed)
    }
}

type IdentityKey = (JobId, String, String, ArtifactKind);

fn identity_key(job_id: &JobId, descriptor: &FileDescriptor) -> IdentityKey {
    (
        job_id.clone(),
        descriptor.filename.clone(),
        descriptor.subfolder.clone(),
        descriptor.kind,
    )
}

/// Process-local artifact table with a unique identity index.
#[derive(Debug, Default)]
pub struct InMemoryArtifactRepository {
    rows: DashMap<ArtifactId, Artifact>,
    identity: DashMap<IdentityKey, ArtifactId>,
}

impl InMemoryArtifactRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactRepository for InMemoryArtifactRepository {
    async fn find_by_identity(
        &self,
        job_id: &JobId,
        descriptor: &FileDescriptor,
    ) -> Result<Option<Artifact>> {
        let Some(id) = self
            .identity
            .get(&identity_key(job_id, descriptor))
            .map(|id| *id)
        else {
            return Ok(None);
        };
        Ok(self.rows.get(&id).map(|row| row.clone()))
    }

    async fn insert(&self, artifact: Artifact) -> Result<InsertOutcome> {
        let key = identity_key(&artifact.job_id, &artifact.descriptor);
        match self.identity.entry(key) {
            Entry::Occupied(entry) => {
                let existing = self
                    .rows
                    .get(entry.get())
                    .map(|row| row.clone())
                    .ok_or_else(|| {
                        KilnError::Internal(
                            "artifact identity points at a missing row".into(),
                        )
                    })?;
                Ok(InsertOutcome::Existing(existing))
            }
            Entry::Vacant(entry) => {
                self.rows.insert(artifact.id, artifact.clone());
                entry.insert(artifact.id);
                Ok(InsertOutcome::Inserted(artifact))
            }
        }
    }

    async fn promote_to_object(
        &self,
        id: ArtifactId,
        location: ArtifactLocation,
        byte_size: u64,
        probed: &ProbedMetadata,
    ) -> Result<Artifact> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| KilnError::not_found("artifact", id.to_string()))?;
        if row.location.is_inline() && !location.is_inline() {
            row.location = location;
            row.byte_size = byte_size;
            if probed.format.is_some() {
                row.format = probed.format.clone();
            }
            if probed.width.is_some() {
                row.width = probed.width;
                row.height = probed.height;
            }
        }
        Ok(row.clone())
    }

    async fn get(&self, id: ArtifactId) -> Result<Option<Artifact>> {
        Ok(self.rows.get(&id).map(|row| row.clone()))
    }

    async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<Artifact>> {
        let mut rows: Vec<Artifact> = self
            .rows
            .iter()
            .filter(|row| &row.job_id == job_id)
            .map(|row| row.clone())
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn delete_for_job(&self, job_id: &JobId) -> Result<u64> {
        self.identity.retain(|key, _| &key.0 != job_id);
        let before = self.rows.len();
        self.rows.retain(|_, artifact| &artifact.job_id != job_id);
        Ok(before.saturating_sub(self.rows.len()) as u64)
    }

    async fn record_use(&self, id: ArtifactId) -> Result<()> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| KilnError::not_found("artifact", id.to_string()))?;
        row.usage_count += 1;
        Ok(())
    }
}
