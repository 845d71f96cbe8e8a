use serde::{Deserialize, Serialize};

use super::{
    ids::JobId,
    job::{GenerationJob, JobCategory},
};

/// State-change notification pushed to live subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobEvent {
    JobUpdate {
        job: Box<GenerationJob>,
    },
    #[serde(rename_all = "camelCase")]
    JobDeleted {
        job_id: JobId,
        category: JobCategory,
    },
    JobsCleared {
        count: u64,
        category: Option<JobCategory>,
    },
}

impl JobEvent {
    pub fn update(job: GenerationJob) -> Self {
        JobEvent::JobUpdate { job: Box::new(job) }
    }

    /// Category used as a routing hint; `None` reaches every subscriber.
    pub fn category(&self) -> Option<JobCategory> {
        match self {
            JobEvent::JobUpdate { job } => Some(job.category),
            JobEvent::JobDeleted { category, .. } => Some(*category),
            JobEvent::JobsCleared { category, .. } => *category,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::JobUpdate { .. } => "job-update",
            JobEvent::JobDeleted { .. } => "job-deleted",
            JobEvent::JobsCleared { .. } => "jobs-cleared",
        }
    }
}
