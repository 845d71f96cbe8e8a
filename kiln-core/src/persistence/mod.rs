//! Storage seams for the job ledger and artifact rows.
//!
//! Both traits have an in-process implementation used for tests and
//! single-node development, and a Postgres implementation behind the
//! `database` feature.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    ledger::transitions::{ApplyOutcome, JobWrite},
    types::{
        Artifact, ArtifactId, ArtifactLocation, FileDescriptor, GenerationJob,
        JobCategory, JobId, OwnerId, ProbedMetadata,
    },
};

pub use memory::{InMemoryArtifactRepository, InMemoryJobRepository};
#[cfg(feature = "database")]
pub use postgres::{PostgresArtifactRepository, PostgresJobRepository};

/// Which of an owner's jobs a listing returns.
#[derive(Debug, Clone)]
pub struct JobListFilter {
    pub category: Option<JobCategory>,
    /// Terminal jobs completed before this instant are hidden.
    pub completed_since: DateTime<Utc>,
    pub limit: usize,
}

#[async_trait]
pub trait JobRepository: Send + Sync + fmt::Debug {
    async fn get(&self, job_id: &JobId) -> Result<Option<GenerationJob>>;

    /// Atomically reads the current record, runs
    /// [`decide`](crate::ledger::transitions::decide) and stores the result.
    async fn apply(&self, write: JobWrite) -> Result<ApplyOutcome>;

    /// Newest first.
    async fn list_for_owner(
        &self,
        owner: &OwnerId,
        filter: &JobListFilter,
    ) -> Result<Vec<GenerationJob>>;

    /// Active jobs with a provider id whose last update predates `updated_before`.
    async fn list_stale_active(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>>;

    async fn delete(
        &self,
        owner: &OwnerId,
        job_id: &JobId,
    ) -> Result<Option<GenerationJob>>;

    /// Removes the owner's terminal jobs and returns their ids.
    async fn clear_terminal(
        &self,
        owner: &OwnerId,
        category: Option<JobCategory>,
    ) -> Result<Vec<JobId>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Artifact),
    /// A row with the same identity already existed and was left alone.
    Existing(Artifact),
}

#[async_trait]
pub trait ArtifactRepository: Send + Sync + fmt::Debug {
    async fn find_by_identity(
        &self,
        job_id: &JobId,
        descriptor: &FileDescriptor,
    ) -> Result<Option<Artifact>>;

    async fn insert(&self, artifact: Artifact) -> Result<InsertOutcome>;

    /// Moves an inline row to an object reference, dropping the inline bytes.
    /// A row that already references an object is returned unchanged.
    async fn promote_to_object(
        &self,
        id: ArtifactId,
        location: ArtifactLocation,
        byte_size: u64,
        probed: &ProbedMetadata,
    ) -> Result<Artifact>;

    async fn get(&self, id: ArtifactId) -> Result<Option<Artifact>>;

    async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<Artifact>>;

    /// Drops every artifact of a job. Returns how many rows went.
    async fn delete_for_job(&self, job_id: &JobId) -> Result<u64>;

    async fn record_use(&self, id: ArtifactId) -> Result<()>;
}
