use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{JobId, OwnerId};
use crate::error::{KilnError, Result};

/// Generation type of a job. Subscribers may narrow their feed by category.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobCategory {
    TextToImage,
    ImageToImage,
    TextToVideo,
    ImageToVideo,
    Upscale,
    ModelTraining,
}

impl JobCategory {
    pub const ALL: [JobCategory; 6] = [
        JobCategory::TextToImage,
        JobCategory::ImageToImage,
        JobCategory::TextToVideo,
        JobCategory::ImageToVideo,
        JobCategory::Upscale,
        JobCategory::ModelTraining,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::TextToImage => "text-to-image",
            JobCategory::ImageToImage => "image-to-image",
            JobCategory::TextToVideo => "text-to-video",
            JobCategory::ImageToVideo => "image-to-video",
            JobCategory::Upscale => "upscale",
            JobCategory::ModelTraining => "model-training",
        }
    }
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobCategory {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        JobCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| {
                KilnError::InvalidInput(format!("unknown job category: {s}"))
            })
    }
}

/// Ledger status. COMPLETED and FAILED are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "processing")]
    Processing,
    #[serde(alias = "completed")]
    Completed,
    #[serde(alias = "failed")]
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(KilnError::InvalidInput(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Canonical ledger record for one compute request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub category: JobCategory,
    pub status: JobStatus,
    pub progress: u8,
    pub stage: Option<String>,
    pub message: Option<String>,
    pub result_refs: Vec<String>,
    pub error: Option<String>,
    pub provider_job_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between `started_at` and the terminal transition.
    pub elapsed_time: Option<f64>,
    /// Provider estimate, in seconds.
    pub estimated_time_remaining: Option<f64>,
    pub metadata: Value,
    pub params: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    /// A fresh PENDING record; the first patch is applied on top of it.
    pub fn pending(
        job_id: JobId,
        owner_id: OwnerId,
        category: JobCategory,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            owner_id,
            category,
            status: JobStatus::Pending,
            progress: 0,
            stage: None,
            message: None,
            result_refs: Vec::new(),
            error: None,
            provider_job_id: None,
            started_at: None,
            completed_at: None,
            elapsed_time: None,
            estimated_time_remaining: None,
            metadata: Value::Object(Default::default()),
            params: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Field-wise update. Provided fields overwrite, omitted fields are kept.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub stage: Option<String>,
    pub message: Option<String>,
    pub result_refs: Option<Vec<String>>,
    pub error: Option<String>,
    pub provider_job_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_time: Option<f64>,
    pub estimated_time_remaining: Option<f64>,
    pub metadata: Option<Value>,
    pub params: Option<Value>,
}

impl JobPatch {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result_refs(mut self, refs: Vec<String>) -> Self {
        self.result_refs = Some(refs);
        self
    }

    pub fn with_provider_job_id(mut self, id: impl Into<String>) -> Self {
        self.provider_job_id = Some(id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(progress) = self.progress
            && progress > 100
        {
            return Err(KilnError::InvalidInput(format!(
                "progress must be within 0..=100, got {progress}"
            )));
        }
        for (name, value) in [
            ("elapsedTime", self.elapsed_time),
            ("estimatedTimeRemaining", self.estimated_time_remaining),
        ] {
            if let Some(v) = value
                && (!v.is_finite() || v < 0.0)
            {
                return Err(KilnError::InvalidInput(format!(
                    "{name} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}
