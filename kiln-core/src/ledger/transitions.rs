//! Status transition rules and the pure merge applied by every job repository.

use std::{
    collections::{HashMap, HashSet},
    sync::LazyLock,
};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    error::{KilnError, Result},
    types::{GenerationJob, JobCategory, JobId, JobPatch, JobStatus, OwnerId},
};

/// Allowed `from -> to` moves. Self-transitions are always listed so that
/// repeated progress updates within a status are accepted.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    allowed: HashMap<JobStatus, HashSet<JobStatus>>,
}

pub static TRANSITIONS: LazyLock<TransitionTable> =
    LazyLock::new(TransitionTable::standard);

impl TransitionTable {
    pub fn standard() -> Self {
        use JobStatus::*;
        let allowed = HashMap::from([
            (
                Pending,
                HashSet::from([Pending, Processing, Completed, Failed]),
            ),
            (Processing, HashSet::from([Processing, Completed, Failed])),
            (Completed, HashSet::from([Completed])),
            (Failed, HashSet::from([Failed])),
        ]);
        Self { allowed }
    }

    pub fn permits(&self, from: JobStatus, to: JobStatus) -> bool {
        self.allowed
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    pub fn check(&self, job_id: &JobId, from: JobStatus, to: JobStatus) -> Result<()> {
        if self.permits(from, to) {
            Ok(())
        } else {
            Err(KilnError::RejectedDowngrade {
                job_id: job_id.to_string(),
                from,
                to,
            })
        }
    }
}

/// One ledger write as handed to a repository.
#[derive(Debug, Clone)]
pub struct JobWrite {
    pub job_id: JobId,
    /// `None` on the callback path, where the job must already exist.
    pub owner: Option<OwnerId>,
    /// Required when the write creates the job.
    pub category: Option<JobCategory>,
    pub patch: JobPatch,
    /// Fail with `InvalidInput` instead of updating an existing record.
    pub create_only: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Created(GenerationJob),
    Updated(GenerationJob),
    /// The stored record was left untouched.
    Rejected {
        current: GenerationJob,
        attempted: JobStatus,
    },
}

impl ApplyOutcome {
    pub fn job(&self) -> &GenerationJob {
        match self {
            ApplyOutcome::Created(job) | ApplyOutcome::Updated(job) => job,
            ApplyOutcome::Rejected { current, .. } => current,
        }
    }
}

/// Decides what a write does to the current record. Repositories call this
/// while holding whatever lock makes read-decide-write atomic for them.
pub fn decide(
    table: &TransitionTable,
    current: Option<&GenerationJob>,
    write: &JobWrite,
) -> Result<ApplyOutcome> {
    let Some(current) = current else {
        let Some(owner) = write.owner.clone() else {
            return Err(KilnError::not_found("job", write.job_id.as_str()));
        };
        let Some(category) = write.category else {
            return Err(KilnError::InvalidInput(format!(
                "category is required to create job {}",
                write.job_id
            )));
        };
        let base =
            GenerationJob::pending(write.job_id.clone(), owner, category, write.now);
        let created = merge(table, &base, &write.patch, write.now)?;
        return Ok(ApplyOutcome::Created(created));
    };

    if write.create_only {
        return Err(KilnError::InvalidInput(format!(
            "job {} already exists",
            write.job_id
        )));
    }

    // Foreign jobs are indistinguishable from missing ones.
    if let Some(owner) = &write.owner
        && owner != &current.owner_id
    {
        return Err(KilnError::not_found("job", write.job_id.as_str()));
    }
    if let Some(category) = write.category
        && category != current.category
    {
        return Err(KilnError::InvalidInput(format!(
            "job {} is {}, not {}",
            write.job_id, current.category, category
        )));
    }

    match merge(table, current, &write.patch, write.now) {
        Ok(next) => Ok(ApplyOutcome::Updated(next)),
        Err(KilnError::RejectedDowngrade { to, .. }) => Ok(ApplyOutcome::Rejected {
            current: current.clone(),
            attempted: to,
        }),
        Err(err) => Err(err),
    }
}

/// Applies `patch` on top of `current`. Fails only with `RejectedDowngrade`.
pub fn merge(
    table: &TransitionTable,
    current: &GenerationJob,
    patch: &JobPatch,
    now: DateTime<Utc>,
) -> Result<GenerationJob> {
    let target = patch.status.unwrap_or(current.status);
    table.check(&current.job_id, current.status, target)?;

    let mut next = current.clone();
    next.status = target;

    if let Some(progress) = patch.progress {
        if progress < current.progress {
            debug!(
                job_id = %current.job_id,
                current = current.progress,
                attempted = progress,
                "ignoring progress regression"
            );
        }
        next.progress = progress.max(current.progress);
    }

    if patch.stage.is_some() {
        next.stage = patch.stage.clone();
    }
    if patch.message.is_some() {
        next.message = patch.message.clone();
    }
    if patch.error.is_some() {
        next.error = patch.error.clone();
    }
    if patch.provider_job_id.is_some() {
        next.provider_job_id = patch.provider_job_id.clone();
    }
    if patch.estimated_time_remaining.is_some() {
        next.estimated_time_remaining = patch.estimated_time_remaining;
    }
    if let Some(refs) = &patch.result_refs {
        next.result_refs = refs.clone();
    }
    if let Some(metadata) = &patch.metadata {
        next.metadata = metadata.clone();
    }
    if let Some(params) = &patch.params {
        next.params = params.clone();
    }

    if patch.started_at.is_some() {
        next.started_at = patch.started_at;
    } else if next.started_at.is_none() && target == JobStatus::Processing {
        next.started_at = Some(now);
    }

    if target.is_terminal() && !current.status.is_terminal() {
        let completed_at = patch.completed_at.unwrap_or(now);
        next.completed_at = Some(completed_at);
        next.estimated_time_remaining = Some(0.0);
        next.elapsed_time = patch.elapsed_time.or_else(|| {
            next.started_at.map(|started| {
                ((completed_at - started).num_milliseconds().max(0) as f64) / 1000.0
            })
        });
    } else if patch.elapsed_time.is_some() {
        next.elapsed_time = patch.elapsed_time;
    }

    if target == JobStatus::Completed {
        next.progress = 100;
    }

    next.updated_at = now;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use proptest::prelude::*;

    use super::*;

    fn job(status: JobStatus) -> GenerationJob {
        let mut job = GenerationJob::pending(
            JobId::parse("j1").unwrap(),
            OwnerId::parse("o1").unwrap(),
            JobCategory::TextToImage,
            Utc::now(),
        );
        job.status = status;
        if status.is_terminal() {
            job.completed_at = Some(job.created_at);
        }
        job
    }

    fn write(patch: JobPatch) -> JobWrite {
        JobWrite {
            job_id: JobId::parse("j1").unwrap(),
            owner: Some(OwnerId::parse("o1").unwrap()),
            category: Some(JobCategory::TextToImage),
            patch,
            create_only: false,
            now: Utc::now(),
        }
    }

    #[test]
    fn create_only_write_refuses_existing_records() {
        let create = JobWrite {
            create_only: true,
            ..write(JobPatch::default().with_status(JobStatus::Pending))
        };
        assert!(matches!(
            decide(&TRANSITIONS, None, &create).unwrap(),
            ApplyOutcome::Created(_)
        ));
        for status in [JobStatus::Pending, JobStatus::Failed] {
            assert!(matches!(
                decide(&TRANSITIONS, Some(&job(status)), &create),
                Err(KilnError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn terminal_states_only_transition_to_themselves() {
        let table = TransitionTable::standard();
        for terminal in [JobStatus::Completed, JobStatus::Failed] {
            for to in [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Completed,
                JobStatus::Failed,
            ] {
                assert_eq!(table.permits(terminal, to), terminal == to);
            }
        }
        assert!(!table.permits(JobStatus::Processing, JobStatus::Pending));
        assert!(table.permits(JobStatus::Pending, JobStatus::Completed));
    }

    #[test]
    fn stale_processing_after_completed_is_rejected_without_change() {
        let current = job(JobStatus::Completed);
        let outcome = decide(
            &TRANSITIONS,
            Some(&current),
            &write(
                JobPatch::default()
                    .with_status(JobStatus::Processing)
                    .with_progress(40),
            ),
        )
        .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Rejected {
                current: current.clone(),
                attempted: JobStatus::Processing,
            }
        );
    }

    #[test]
    fn statusless_patch_on_terminal_job_still_applies() {
        let current = job(JobStatus::Failed);
        let outcome = decide(
            &TRANSITIONS,
            Some(&current),
            &write(JobPatch::default().with_message("retry disabled")),
        )
        .unwrap();
        let ApplyOutcome::Updated(next) = outcome else {
            panic!("expected update, got {outcome:?}");
        };
        assert_eq!(next.status, JobStatus::Failed);
        assert_eq!(next.message.as_deref(), Some("retry disabled"));
        assert_eq!(next.completed_at, current.completed_at);
    }

    #[test]
    fn completion_forces_full_progress_and_stamps_timing() {
        let now = Utc::now();
        let mut current = job(JobStatus::Processing);
        current.started_at = Some(now - Duration::seconds(4));
        current.progress = 70;
        let next = merge(
            &TRANSITIONS,
            &current,
            &JobPatch::default().with_status(JobStatus::Completed),
            now,
        )
        .unwrap();
        assert_eq!(next.progress, 100);
        assert_eq!(next.completed_at, Some(now));
        assert_eq!(next.elapsed_time, Some(4.0));
    }

    #[test]
    fn first_processing_update_stamps_started_at() {
        let now = Utc::now();
        let next = merge(
            &TRANSITIONS,
            &job(JobStatus::Pending),
            &JobPatch::default().with_status(JobStatus::Processing),
            now,
        )
        .unwrap();
        assert_eq!(next.started_at, Some(now));
        assert!(next.completed_at.is_none());
    }

    #[test]
    fn foreign_owner_sees_not_found() {
        let current = job(JobStatus::Pending);
        let mut w = write(JobPatch::default());
        w.owner = Some(OwnerId::parse("intruder").unwrap());
        assert!(matches!(
            decide(&TRANSITIONS, Some(&current), &w),
            Err(KilnError::NotFound { .. })
        ));
    }

    #[test]
    fn callback_write_cannot_create_jobs() {
        let mut w = write(JobPatch::default().with_status(JobStatus::Processing));
        w.owner = None;
        assert!(matches!(
            decide(&TRANSITIONS, None, &w),
            Err(KilnError::NotFound { .. })
        ));
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Pending),
            Just(JobStatus::Processing),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
        ]
    }

    proptest! {
        #[test]
        fn terminal_status_is_absorbing(
            updates in proptest::collection::vec(
                (proptest::option::of(status_strategy()), proptest::option::of(0u8..=100)),
                1..24,
            )
        ) {
            let mut current = job(JobStatus::Pending);
            let mut terminal: Option<JobStatus> = None;
            for (status, progress) in updates {
                let patch = JobPatch { status, progress, ..JobPatch::default() };
                let before_progress = current.progress;
                match decide(&TRANSITIONS, Some(&current), &write(patch)).unwrap() {
                    ApplyOutcome::Updated(next) => current = next,
                    ApplyOutcome::Rejected { .. } => {}
                    ApplyOutcome::Created(_) => unreachable!(),
                }
                prop_assert!(current.progress >= before_progress);
                prop_assert_eq!(current.completed_at.is_some(), current.status.is_terminal());
                if let Some(t) = terminal {
                    prop_assert_eq!(current.status, t);
                }
                if current.status.is_terminal() {
                    terminal = Some(current.status);
                }
            }
        }
    }
}
