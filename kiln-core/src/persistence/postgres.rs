use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::{ArtifactRepository, InsertOutcome, JobListFilter, JobRepository};
use crate::{
    error::{KilnError, Result},
    ledger::transitions::{ApplyOutcome, JobWrite, TRANSITIONS, decide},
    types::{
        Artifact, ArtifactId, ArtifactLocation, FileDescriptor, GenerationJob,
        JobCategory, JobId, OwnerId, ProbedMetadata,
    },
};

const JOB_COLUMNS: &str = r#"
    job_id, owner_id, category, status, progress, stage, message, result_refs,
    error, provider_job_id, started_at, completed_at, elapsed_time,
    estimated_time_remaining, metadata, params, created_at, updated_at
"#;

const ARTIFACT_COLUMNS: &str = r#"
    id, job_id, owner_id, filename, subfolder, kind, inline_data, object_key,
    external_path, byte_size, format, width, height, metadata, usage_count,
    created_at
"#;

const TERMINAL_STATUSES: &str = "('COMPLETED', 'FAILED')";
const ACTIVE_STATUSES: &str = "('PENDING', 'PROCESSING')";

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: String,
    owner_id: String,
    category: String,
    status: String,
    progress: i16,
    stage: Option<String>,
    message: Option<String>,
    result_refs: Value,
    error: Option<String>,
    provider_job_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    elapsed_time: Option<f64>,
    estimated_time_remaining: Option<f64>,
    metadata: Value,
    params: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for GenerationJob {
    type Error = KilnError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(GenerationJob {
            job_id: JobId::parse(row.job_id)?,
            owner_id: OwnerId::parse(row.owner_id)?,
            category: row.category.parse()?,
            status: row.status.parse()?,
            progress: u8::try_from(row.progress.clamp(0, 100)).unwrap_or(100),
            stage: row.stage,
            message: row.message,
            result_refs: serde_json::from_value(row.result_refs)?,
            error: row.error,
            provider_job_id: row.provider_job_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            elapsed_time: row.elapsed_time,
            estimated_time_remaining: row.estimated_time_remaining,
            metadata: row.metadata,
            params: row.params,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PostgresJobRepository {
    pool: PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl fmt::Debug for PostgresJobRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresJobRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

async fn insert_job<'e, E>(executor: E, job: &GenerationJob) -> Result<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO generation_jobs (
            job_id, owner_id, category, status, progress, stage, message,
            result_refs, error, provider_job_id, started_at, completed_at,
            elapsed_time, estimated_time_remaining, metadata, params,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18)
        ON CONFLICT (job_id) DO NOTHING
        "#,
    )
    .bind(job.job_id.as_str())
    .bind(job.owner_id.as_str())
    .bind(job.category.as_str())
    .bind(job.status.as_str())
    .bind(i16::from(job.progress))
    .bind(&job.stage)
    .bind(&job.message)
    .bind(serde_json::to_value(&job.result_refs)?)
    .bind(&job.error)
    .bind(&job.provider_job_id)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.elapsed_time)
    .bind(job.estimated_time_remaining)
    .bind(&job.metadata)
    .bind(&job.params)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn update_job<'e, E>(executor: E, job: &GenerationJob) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        UPDATE generation_jobs SET
            status = $2,
            progress = $3,
            stage = $4,
            message = $5,
            result_refs = $6,
            error = $7,
            provider_job_id = $8,
            started_at = $9,
            completed_at = $10,
            elapsed_time = $11,
            estimated_time_remaining = $12,
            metadata = $13,
            params = $14,
            updated_at = $15
        WHERE job_id = $1
        "#,
    )
    .bind(job.job_id.as_str())
    .bind(job.status.as_str())
    .bind(i16::from(job.progress))
    .bind(&job.stage)
    .bind(&job.message)
    .bind(serde_json::to_value(&job.result_refs)?)
    .bind(&job.error)
    .bind(&job.provider_job_id)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.elapsed_time)
    .bind(job.estimated_time_remaining)
    .bind(&job.metadata)
    .bind(&job.params)
    .bind(job.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

fn rows_to_jobs(rows: Vec<JobRow>) -> Result<Vec<GenerationJob>> {
    rows.into_iter().map(GenerationJob::try_from).collect()
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    async fn get(&self, job_id: &JobId) -> Result<Option<GenerationJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE job_id = $1"
        ))
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(GenerationJob::try_from).transpose()
    }

    async fn apply(&self, write: JobWrite) -> Result<ApplyOutcome> {
        // A concurrent creator can win the insert between our SELECT and
        // INSERT; the second pass then sees its row under FOR UPDATE.
        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let current = sqlx::query_as::<_, JobRow>(&format!(
                "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE job_id = $1 FOR UPDATE"
            ))
            .bind(write.job_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .map(GenerationJob::try_from)
            .transpose()?;

            let outcome = decide(&TRANSITIONS, current.as_ref(), &write)?;
            match &outcome {
                ApplyOutcome::Created(job) => {
                    if !insert_job(&mut *tx, job).await? {
                        tx.rollback().await?;
                        debug!(job_id = %write.job_id, "lost job insert race, retrying");
                        continue;
                    }
                }
                ApplyOutcome::Updated(job) => update_job(&mut *tx, job).await?,
                ApplyOutcome::Rejected { .. } => {}
            }
            tx.commit().await?;
            return Ok(outcome);
        }
        Err(KilnError::Internal(format!(
            "job {} insert raced repeatedly",
            write.job_id
        )))
    }

    async fn list_for_owner(
        &self,
        owner: &OwnerId,
        filter: &JobListFilter,
    ) -> Result<Vec<GenerationJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE owner_id = $1
              AND ($2::TEXT IS NULL OR category = $2)
              AND (completed_at IS NULL OR completed_at >= $3)
            ORDER BY created_at DESC, job_id DESC
            LIMIT $4
            "#
        ))
        .bind(owner.as_str())
        .bind(filter.category.map(|c| c.as_str()))
        .bind(filter.completed_since)
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows_to_jobs(rows)
    }

    async fn list_stale_active(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE status IN {ACTIVE_STATUSES}
              AND provider_job_id IS NOT NULL
              AND updated_at <= $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(updated_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows_to_jobs(rows)
    }

    async fn delete(
        &self,
        owner: &OwnerId,
        job_id: &JobId,
    ) -> Result<Option<GenerationJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            DELETE FROM generation_jobs
            WHERE owner_id = $1 AND job_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(owner.as_str())
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(GenerationJob::try_from).transpose()
    }

    async fn clear_terminal(
        &self,
        owner: &OwnerId,
        category: Option<JobCategory>,
    ) -> Result<Vec<JobId>> {
        let removed: Vec<String> = sqlx::query_scalar(&format!(
            r#"
            DELETE FROM generation_jobs
            WHERE owner_id = $1
              AND status IN {TERMINAL_STATUSES}
              AND ($2::TEXT IS NULL OR category = $2)
            RETURNING job_id
            "#
        ))
        .bind(owner.as_str())
        .bind(category.map(|c| c.as_str()))
        .fetch_all(&self.pool)
        .await?;
        removed.into_iter().map(JobId::parse).collect()
    }
}

#[derive(Debug, FromRow)]
struct ArtifactRow {
    id: Uuid,
    job_id: String,
    owner_id: String,
    filename: String,
    subfolder: String,
    kind: String,
    inline_data: Option<Vec<u8>>,
    object_key: Option<String>,
    external_path: Option<String>,
    byte_size: i64,
    format: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    metadata: Option<Value>,
    usage_count: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<ArtifactRow> for Artifact {
    type Error = KilnError;

    fn try_from(row: ArtifactRow) -> Result<Self> {
        let location = match (row.inline_data, row.object_key) {
            (Some(data), None) => ArtifactLocation::Inline(data),
            (None, Some(key)) => ArtifactLocation::Object {
                key,
                external_path: row.external_path,
            },
            _ => {
                return Err(KilnError::Internal(format!(
                    "artifact {} does not have exactly one location",
                    row.id
                )));
            }
        };
        Ok(Artifact {
            id: ArtifactId(row.id),
            job_id: JobId::parse(row.job_id)?,
            owner_id: OwnerId::parse(row.owner_id)?,
            descriptor: FileDescriptor {
                filename: row.filename,
                subfolder: row.subfolder,
                kind: row.kind.parse()?,
            },
            location,
            byte_size: u64::try_from(row.byte_size).unwrap_or_default(),
            format: row.format,
            width: row.width.and_then(|w| u32::try_from(w).ok()),
            height: row.height.and_then(|h| u32::try_from(h).ok()),
            metadata: row.metadata,
            usage_count: row.usage_count,
            created_at: row.created_at,
        })
    }
}

fn to_i32(value: Option<u32>) -> Option<i32> {
    value.and_then(|v| i32::try_from(v).ok())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct PostgresArtifactRepository {
    pool: PgPool,
}

impl PostgresArtifactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl fmt::Debug for PostgresArtifactRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresArtifactRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[async_trait]
impl ArtifactRepository for PostgresArtifactRepository {
    async fn find_by_identity(
        &self,
        job_id: &JobId,
        descriptor: &FileDescriptor,
    ) -> Result<Option<Artifact>> {
        let row = sqlx::query_as::<_, ArtifactRow>(&format!(
            r#"
            SELECT {ARTIFACT_COLUMNS}
            FROM artifacts
            WHERE job_id = $1 AND filename = $2 AND subfolder = $3 AND kind = $4
            "#
        ))
        .bind(job_id.as_str())
        .bind(&descriptor.filename)
        .bind(&descriptor.subfolder)
        .bind(descriptor.kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Artifact::try_from).transpose()
    }

    async fn insert(&self, artifact: Artifact) -> Result<InsertOutcome> {
        let (inline_data, object_key, external_path) = match &artifact.location {
            ArtifactLocation::Inline(data) => (Some(data.as_slice()), None, None),
            ArtifactLocation::Object { key, external_path } => {
                (None, Some(key.as_str()), external_path.as_deref())
            }
        };
        let inserted = sqlx::query_as::<_, ArtifactRow>(&format!(
            r#"
            INSERT INTO artifacts (
                id, job_id, owner_id, filename, subfolder, kind, inline_data,
                object_key, external_path, byte_size, format, width, height,
                metadata, usage_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16)
            ON CONFLICT ON CONSTRAINT artifacts_identity DO NOTHING
            RETURNING {ARTIFACT_COLUMNS}
            "#
        ))
        .bind(artifact.id.0)
        .bind(artifact.job_id.as_str())
        .bind(artifact.owner_id.as_str())
        .bind(&artifact.descriptor.filename)
        .bind(&artifact.descriptor.subfolder)
        .bind(artifact.descriptor.kind.as_str())
        .bind(inline_data)
        .bind(object_key)
        .bind(external_path)
        .bind(to_i64(artifact.byte_size))
        .bind(&artifact.format)
        .bind(to_i32(artifact.width))
        .bind(to_i32(artifact.height))
        .bind(&artifact.metadata)
        .bind(artifact.usage_count)
        .bind(artifact.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Inserted(Artifact::try_from(row)?));
        }
        let existing = self
            .find_by_identity(&artifact.job_id, &artifact.descriptor)
            .await?
            .ok_or_else(|| {
                KilnError::Internal(format!(
                    "artifact {} conflicted but no row holds its identity",
                    artifact.id
                ))
            })?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn promote_to_object(
        &self,
        id: ArtifactId,
        location: ArtifactLocation,
        byte_size: u64,
        probed: &ProbedMetadata,
    ) -> Result<Artifact> {
        let ArtifactLocation::Object { key, external_path } = location else {
            return Err(KilnError::InvalidInput(
                "artifacts can only be promoted to an object reference".into(),
            ));
        };
        let updated = sqlx::query_as::<_, ArtifactRow>(&format!(
            r#"
            UPDATE artifacts SET
                inline_data = NULL,
                object_key = $2,
                external_path = $3,
                byte_size = $4,
                format = COALESCE($5, format),
                width = COALESCE($6, width),
                height = COALESCE($7, height)
            WHERE id = $1 AND object_key IS NULL
            RETURNING {ARTIFACT_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(&key)
        .bind(&external_path)
        .bind(to_i64(byte_size))
        .bind(&probed.format)
        .bind(to_i32(probed.width))
        .bind(to_i32(probed.height))
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(row) => Artifact::try_from(row),
            None => self
                .get(id)
                .await?
                .ok_or_else(|| KilnError::not_found("artifact", id.to_string())),
        }
    }

    async fn get(&self, id: ArtifactId) -> Result<Option<Artifact>> {
        let row = sqlx::query_as::<_, ArtifactRow>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Artifact::try_from).transpose()
    }

    async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<Artifact>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE job_id = $1 ORDER BY created_at"
        ))
        .bind(job_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Artifact::try_from).collect()
    }

    async fn delete_for_job(&self, job_id: &JobId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM artifacts WHERE job_id = $1")
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_use(&self, id: ArtifactId) -> Result<()> {
        let result =
            sqlx::query("UPDATE artifacts SET usage_count = usage_count + 1 WHERE id = $1")
                .bind(id.0)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(KilnError::not_found("artifact", id.to_string()));
        }
        Ok(())
    }
}
