//! Job submission: ledger entry first, provider call in the background.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    error::Result,
    ledger::JobLedger,
    provider::{ProviderClient, ProviderSubmission},
    types::{GenerationJob, JobCategory, JobId, JobPatch, JobStatus, OwnerId},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    /// Generated when absent.
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub category: JobCategory,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug)]
pub struct Submission {
    /// The PENDING record as first written.
    pub job: GenerationJob,
    pub dispatch: JoinHandle<()>,
}

pub struct SubmissionService {
    ledger: Arc<JobLedger>,
    provider: Arc<dyn ProviderClient>,
    callback_url: Option<String>,
}

impl fmt::Debug for SubmissionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionService")
            .field("provider", &self.provider)
            .field("callback_url", &self.callback_url)
            .finish()
    }
}

impl SubmissionService {
    pub fn new(
        ledger: Arc<JobLedger>,
        provider: Arc<dyn ProviderClient>,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            ledger,
            provider,
            callback_url,
        }
    }

    #[instrument(skip_all, fields(owner = %owner, category = %request.category))]
    pub async fn submit(&self, owner: &OwnerId, request: SubmitJobRequest) -> Result<Submission> {
        let job_id = match request.job_id {
            Some(id) => id,
            None => JobId::parse(Uuid::now_v7().to_string())?,
        };
        let patch = JobPatch {
            status: Some(JobStatus::Pending),
            params: Some(request.params.clone()),
            metadata: request.metadata,
            ..JobPatch::default()
        };
        let job = self
            .ledger
            .create(owner, &job_id, request.category, patch)
            .await?;

        let submission = ProviderSubmission {
            job_id: job_id.clone(),
            category: request.category,
            params: request.params,
            callback_url: self.callback_url.clone(),
        };
        let dispatch = tokio::spawn(dispatch(
            Arc::clone(&self.ledger),
            Arc::clone(&self.provider),
            submission,
        ));
        info!(job_id = %job_id, "job submitted");
        Ok(Submission { job, dispatch })
    }
}

/// Hands the job to the provider and records the outcome in the ledger.
async fn dispatch(
    ledger: Arc<JobLedger>,
    provider: Arc<dyn ProviderClient>,
    submission: ProviderSubmission,
) {
    let job_id = submission.job_id.clone();
    let patch = match provider.submit(&submission).await {
        Ok(provider_job_id) => JobPatch::default()
            .with_status(JobStatus::Processing)
            .with_provider_job_id(provider_job_id),
        Err(err) => {
            error!(job_id = %job_id, error = %err, "provider rejected job");
            JobPatch::default()
                .with_status(JobStatus::Failed)
                .with_error(err.to_string())
        }
    };
    if let Err(err) = ledger.apply_update(&job_id, patch).await {
        error!(job_id = %job_id, error = %err, "failed to record dispatch outcome");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        error::KilnError, ledger::LedgerConfig, persistence::InMemoryJobRepository,
        provider::MockProviderClient, realtime::FanoutHub,
    };

    fn service(provider: MockProviderClient) -> SubmissionService {
        SubmissionService::new(
            Arc::new(JobLedger::new(
                Arc::new(InMemoryJobRepository::new()),
                FanoutHub::default(),
                LedgerConfig::default(),
            )),
            Arc::new(provider),
            Some("http://kiln.local/api/v1/callbacks/provider".into()),
        )
    }

    fn request(job_id: &str) -> SubmitJobRequest {
        SubmitJobRequest {
            job_id: Some(JobId::parse(job_id).unwrap()),
            category: JobCategory::TextToImage,
            params: json!({"prompt": "a kiln at dusk"}),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn accepted_job_moves_to_processing() {
        let mut provider = MockProviderClient::new();
        provider
            .expect_submit()
            .withf(|s| s.callback_url.is_some() && s.params["prompt"] == "a kiln at dusk")
            .times(1)
            .returning(|_| Ok("p-77".into()));
        let service = service(provider);
        let owner = OwnerId::parse("o1").unwrap();

        let submission = service.submit(&owner, request("j1")).await.unwrap();
        assert_eq!(submission.job.status, JobStatus::Pending);
        submission.dispatch.await.unwrap();

        let job = service.ledger.get(&submission.job.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.provider_job_id.as_deref(), Some("p-77"));
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn rejected_job_fails_and_resubmission_is_refused() {
        let mut provider = MockProviderClient::new();
        provider
            .expect_submit()
            .times(1)
            .returning(|_| Err(KilnError::InvalidInput("unknown model".into())));
        let service = service(provider);
        let owner = OwnerId::parse("o1").unwrap();

        let submission = service.submit(&owner, request("j1")).await.unwrap();
        submission.dispatch.await.unwrap();
        let job = service.ledger.get(&submission.job.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        assert!(job.error.unwrap().contains("unknown model"));

        assert!(matches!(
            service.submit(&owner, request("j1")).await,
            Err(KilnError::InvalidInput(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_of_one_id_dispatch_once() {
        let mut provider = MockProviderClient::new();
        provider
            .expect_submit()
            .times(1)
            .returning(|_| Ok("p-1".into()));
        let service = Arc::new(service(provider));
        let owner = OwnerId::parse("o1").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            let owner = owner.clone();
            handles.push(tokio::spawn(async move {
                service.submit(&owner, request("race")).await
            }));
        }
        let mut accepted = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(submission) => accepted.push(submission),
                Err(err) => assert!(matches!(err, KilnError::InvalidInput(_))),
            }
        }
        assert_eq!(accepted.len(), 1);
        for submission in accepted {
            submission.dispatch.await.unwrap();
        }
    }
}
