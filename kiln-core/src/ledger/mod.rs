//! The generation job ledger.
//!
//! Every status write goes through [`JobLedger`], which serialises writes per
//! job, applies the anti-downgrade rules and publishes accepted changes to the
//! owner's realtime topic.

pub mod locks;
pub mod transitions;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    error::{KilnError, Result},
    persistence::{JobListFilter, JobRepository},
    realtime::FanoutHub,
    types::{GenerationJob, JobCategory, JobEvent, JobId, JobPatch, OwnerId},
};

pub use locks::StripedLocks;
pub use transitions::{ApplyOutcome, JobWrite, TRANSITIONS, TransitionTable};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Terminal jobs older than this drop out of listings.
    pub retention_hours: u32,
    pub list_limit: usize,
    pub lock_stripes: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            list_limit: 500,
            lock_stripes: 64,
        }
    }
}

#[derive(Debug)]
pub struct JobLedger {
    repo: Arc<dyn JobRepository>,
    hub: FanoutHub,
    locks: StripedLocks,
    config: LedgerConfig,
}

impl JobLedger {
    pub fn new(repo: Arc<dyn JobRepository>, hub: FanoutHub, config: LedgerConfig) -> Self {
        Self {
            repo,
            hub,
            locks: StripedLocks::new(config.lock_stripes),
            config,
        }
    }

    pub fn hub(&self) -> &FanoutHub {
        &self.hub
    }

    /// Creates or updates a job on behalf of its owner. `category` is required
    /// when the job does not exist yet.
    #[instrument(skip_all, fields(owner = %owner, job_id = %job_id))]
    pub async fn upsert(
        &self,
        owner: &OwnerId,
        job_id: &JobId,
        category: Option<JobCategory>,
        patch: JobPatch,
    ) -> Result<GenerationJob> {
        self.write(JobWrite {
            job_id: job_id.clone(),
            owner: Some(owner.clone()),
            category,
            patch,
            create_only: false,
            now: Utc::now(),
        })
        .await
    }

    /// Creates a job and fails with `InvalidInput` if the id is taken.
    #[instrument(skip_all, fields(owner = %owner, job_id = %job_id))]
    pub async fn create(
        &self,
        owner: &OwnerId,
        job_id: &JobId,
        category: JobCategory,
        patch: JobPatch,
    ) -> Result<GenerationJob> {
        self.write(JobWrite {
            job_id: job_id.clone(),
            owner: Some(owner.clone()),
            category: Some(category),
            patch,
            create_only: true,
            now: Utc::now(),
        })
        .await
    }

    /// Updates an existing job from a trusted internal path (provider
    /// callbacks, upload registration, reconciliation).
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn apply_update(
        &self,
        job_id: &JobId,
        patch: JobPatch,
    ) -> Result<GenerationJob> {
        self.write(JobWrite {
            job_id: job_id.clone(),
            owner: None,
            category: None,
            patch,
            create_only: false,
            now: Utc::now(),
        })
        .await
    }

    async fn write(&self, write: JobWrite) -> Result<GenerationJob> {
        write.patch.validate()?;
        let _guard = self.locks.lock(&write.job_id).await;
        match self.repo.apply(write).await? {
            ApplyOutcome::Created(job) | ApplyOutcome::Updated(job) => {
                let delivered = self.hub.publish(&job.owner_id, &JobEvent::update(job.clone()));
                debug!(
                    job_id = %job.job_id,
                    status = %job.status,
                    progress = job.progress,
                    delivered,
                    "job updated"
                );
                Ok(job)
            }
            ApplyOutcome::Rejected { current, attempted } => {
                info!(
                    job_id = %current.job_id,
                    current = %current.status,
                    attempted = %attempted,
                    "ignoring stale status update"
                );
                Ok(current)
            }
        }
    }

    pub async fn get(&self, job_id: &JobId) -> Result<GenerationJob> {
        self.repo
            .get(job_id)
            .await?
            .ok_or_else(|| KilnError::not_found("job", job_id.as_str()))
    }

    /// Like [`get`](Self::get), but foreign jobs are reported as missing.
    pub async fn get_owned(&self, owner: &OwnerId, job_id: &JobId) -> Result<GenerationJob> {
        match self.repo.get(job_id).await? {
            Some(job) if &job.owner_id == owner => Ok(job),
            _ => Err(KilnError::not_found("job", job_id.as_str())),
        }
    }

    /// The owner's active jobs plus terminal jobs still inside the retention
    /// window, newest first.
    pub async fn list(
        &self,
        owner: &OwnerId,
        category: Option<JobCategory>,
    ) -> Result<Vec<GenerationJob>> {
        let filter = JobListFilter {
            category,
            completed_since: Utc::now()
                - ChronoDuration::hours(i64::from(self.config.retention_hours)),
            limit: self.config.list_limit,
        };
        self.repo.list_for_owner(owner, &filter).await
    }

    #[instrument(skip_all, fields(owner = %owner, job_id = %job_id))]
    pub async fn delete(&self, owner: &OwnerId, job_id: &JobId) -> Result<GenerationJob> {
        let _guard = self.locks.lock(job_id).await;
        let job = self
            .repo
            .delete(owner, job_id)
            .await?
            .ok_or_else(|| KilnError::not_found("job", job_id.as_str()))?;
        self.hub.publish(
            owner,
            &JobEvent::JobDeleted {
                job_id: job.job_id.clone(),
                category: job.category,
            },
        );
        info!(job_id = %job.job_id, "job deleted");
        Ok(job)
    }

    /// Removes the owner's COMPLETED and FAILED jobs and returns their ids.
    #[instrument(skip_all, fields(owner = %owner))]
    pub async fn clear_completed(
        &self,
        owner: &OwnerId,
        category: Option<JobCategory>,
    ) -> Result<Vec<JobId>> {
        let removed = self.repo.clear_terminal(owner, category).await?;
        let count = removed.len() as u64;
        self.hub
            .publish(owner, &JobEvent::JobsCleared { count, category });
        info!(count, ?category, "cleared terminal jobs");
        Ok(removed)
    }

    /// Active jobs that have not heard from their provider for `older_than`.
    pub async fn stale_active(
        &self,
        older_than: std::time::Duration,
        limit: usize,
    ) -> Result<Vec<GenerationJob>> {
        let older_than = ChronoDuration::from_std(older_than)
            .map_err(|err| KilnError::InvalidInput(format!("stale window: {err}")))?;
        self.repo
            .list_stale_active(Utc::now() - older_than, limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{persistence::InMemoryJobRepository, types::JobStatus};

    fn ledger() -> JobLedger {
        JobLedger::new(
            Arc::new(InMemoryJobRepository::new()),
            FanoutHub::default(),
            LedgerConfig::default(),
        )
    }

    fn ids() -> (OwnerId, JobId) {
        (OwnerId::parse("o1").unwrap(), JobId::parse("j1").unwrap())
    }

    #[tokio::test]
    async fn late_processing_update_after_completion_is_absorbed() {
        let ledger = ledger();
        let (owner, job_id) = ids();
        let mut feed = ledger.hub().subscribe(owner.clone(), None);

        ledger
            .upsert(
                &owner,
                &job_id,
                Some(JobCategory::TextToImage),
                JobPatch::default().with_status(JobStatus::Pending),
            )
            .await
            .unwrap();
        ledger
            .apply_update(&job_id, JobPatch::default().with_status(JobStatus::Completed))
            .await
            .unwrap();
        let after = ledger
            .apply_update(
                &job_id,
                JobPatch::default()
                    .with_status(JobStatus::Processing)
                    .with_progress(40),
            )
            .await
            .unwrap();

        assert_eq!(after.status, JobStatus::Completed);
        assert_eq!(after.progress, 100);
        assert!(after.completed_at.is_some());

        // Two publications; the rejected update is silent.
        assert!(feed.recv().await.is_some());
        let Some(JobEvent::JobUpdate { job }) = feed.recv().await else {
            panic!("expected a job update");
        };
        assert_eq!(job.status, JobStatus::Completed);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), feed.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn failed_then_completed_stays_failed() {
        let ledger = ledger();
        let (owner, job_id) = ids();
        ledger
            .upsert(
                &owner,
                &job_id,
                Some(JobCategory::Upscale),
                JobPatch::default().with_status(JobStatus::Processing),
            )
            .await
            .unwrap();
        ledger
            .apply_update(
                &job_id,
                JobPatch::default()
                    .with_status(JobStatus::Failed)
                    .with_error("out of memory"),
            )
            .await
            .unwrap();
        let after = ledger
            .apply_update(&job_id, JobPatch::default().with_status(JobStatus::Completed))
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.error.as_deref(), Some("out of memory"));
    }

    #[tokio::test]
    async fn concurrent_writers_never_regress_a_terminal_job() {
        let ledger = Arc::new(ledger());
        let (owner, job_id) = ids();
        ledger
            .upsert(&owner, &job_id, Some(JobCategory::TextToVideo), JobPatch::default())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..32u8 {
            let ledger = ledger.clone();
            let job_id = job_id.clone();
            handles.push(tokio::spawn(async move {
                let patch = if i == 16 {
                    JobPatch::default().with_status(JobStatus::Completed)
                } else {
                    JobPatch::default()
                        .with_status(JobStatus::Processing)
                        .with_progress(i * 3)
                };
                ledger.apply_update(&job_id, patch).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let job = ledger.get(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
    }

    #[tokio::test]
    async fn delete_and_clear_publish_events() {
        let ledger = ledger();
        let (owner, job_id) = ids();
        let other = JobId::parse("j2").unwrap();
        for id in [&job_id, &other] {
            ledger
                .upsert(
                    &owner,
                    id,
                    Some(JobCategory::Upscale),
                    JobPatch::default().with_status(JobStatus::Failed),
                )
                .await
                .unwrap();
        }
        let mut feed = ledger.hub().subscribe(owner.clone(), None);

        ledger.delete(&owner, &job_id).await.unwrap();
        assert!(matches!(
            feed.recv().await,
            Some(JobEvent::JobDeleted { .. })
        ));
        assert!(matches!(
            ledger.delete(&owner, &job_id).await,
            Err(KilnError::NotFound { .. })
        ));

        assert_eq!(ledger.clear_completed(&owner, None).await.unwrap().len(), 1);
        assert!(matches!(
            feed.recv().await,
            Some(JobEvent::JobsCleared { count: 1, .. })
        ));
        assert!(ledger.list(&owner, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_hides_foreign_jobs() {
        let ledger = ledger();
        let (owner, job_id) = ids();
        ledger
            .upsert(&owner, &job_id, Some(JobCategory::Upscale), JobPatch::default())
            .await
            .unwrap();
        let stranger = OwnerId::parse("o2").unwrap();
        assert!(ledger.list(&stranger, None).await.unwrap().is_empty());
        assert!(ledger.get_owned(&stranger, &job_id).await.is_err());
        assert_eq!(ledger.list(&owner, None).await.unwrap().len(), 1);
    }
}
