//! The external asynchronous compute provider, as seen from the service.

pub mod http;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::Result,
    retry::RetryPolicy,
    types::{FileDescriptor, JobCategory, JobId, JobPatch, StorageHints},
};

pub use http::HttpProviderClient;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Handed to the provider so it can post progress back to us.
    pub callback_url: Option<String>,
    pub request_timeout_secs: u64,
    /// Output downloads can be large; they get a longer bound.
    pub download_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl ProviderConfig {
    /// Retry policy for output downloads, bounded by the download timeout.
    pub fn download_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout_ms: self.download_timeout_secs.saturating_mul(1_000),
            ..self.retry.clone()
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".into(),
            api_key: None,
            callback_url: None,
            request_timeout_secs: 30,
            download_timeout_secs: 300,
            retry: RetryPolicy::default(),
        }
    }
}

/// Body of a provider job submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSubmission {
    pub job_id: JobId,
    pub category: JobCategory,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// One produced file. Carries its bytes, a download url, or a reference to
/// bytes the provider already wrote to the object store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOutput {
    #[serde(flatten)]
    pub descriptor: FileDescriptor,
    /// Base64-encoded payload.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(flatten)]
    pub hints: StorageHints,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// A progress or completion notification for one job. Webhook bodies
/// deserialize straight into this.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEvent {
    pub job_id: JobId,
    #[serde(flatten)]
    pub patch: JobPatch,
    #[serde(default)]
    pub outputs: Vec<ProviderOutput>,
}

/// What the provider's history API knows about a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderJobSnapshot {
    #[serde(flatten)]
    pub patch: JobPatch,
    #[serde(default)]
    pub outputs: Vec<ProviderOutput>,
}

impl ProviderJobSnapshot {
    pub fn into_event(self, job_id: JobId) -> ProviderEvent {
        ProviderEvent {
            job_id,
            patch: self.patch,
            outputs: self.outputs,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync + fmt::Debug {
    /// Queues a job and returns the provider's id for it.
    async fn submit(&self, submission: &ProviderSubmission) -> Result<String>;

    /// Downloads one output. Relative urls resolve against the provider.
    async fn fetch_output(&self, url: &str) -> Result<Vec<u8>>;

    /// `None` while the provider has no record of the job.
    async fn job_history(&self, provider_job_id: &str) -> Result<Option<ProviderJobSnapshot>>;
}
