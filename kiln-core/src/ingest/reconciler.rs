use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::CallbackIngestor;
use crate::{
    error::Result,
    provider::ProviderClient,
    types::{GenerationJob, JobId, OwnerId},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Active jobs quiet for this long are polled.
    pub stale_after_secs: u64,
    pub batch_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            stale_after_secs: 300,
            batch_size: 50,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// The job was never accepted by the provider.
    NoProviderId,
    /// The provider has no history for the job yet.
    Unknown,
    Applied(GenerationJob),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Polls the provider's history API for jobs whose callbacks went missing.
pub struct Reconciler {
    ingestor: Arc<CallbackIngestor>,
    provider: Arc<dyn ProviderClient>,
    config: ReconcilerConfig,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        ingestor: Arc<CallbackIngestor>,
        provider: Arc<dyn ProviderClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            ingestor,
            provider,
            config,
        }
    }

    #[instrument(skip_all, fields(job_id = %job.job_id))]
    pub async fn reconcile_job(&self, job: &GenerationJob) -> Result<ReconcileOutcome> {
        let Some(provider_job_id) = job.provider_job_id.as_deref() else {
            return Ok(ReconcileOutcome::NoProviderId);
        };
        let Some(snapshot) = self.provider.job_history(provider_job_id).await? else {
            debug!(provider_job_id, "provider has no history for job");
            return Ok(ReconcileOutcome::Unknown);
        };
        let updated = self
            .ingestor
            .ingest(snapshot.into_event(job.job_id.clone()))
            .await?;
        Ok(ReconcileOutcome::Applied(updated))
    }

    /// One sweep over the stale active jobs. Per-job failures are counted,
    /// not propagated.
    pub async fn run_once(&self) -> Result<ReconcileSummary> {
        let stale = self
            .ingestor
            .ledger()
            .stale_active(self.config.stale_after(), self.config.batch_size)
            .await?;
        let mut summary = ReconcileSummary {
            examined: stale.len(),
            ..Default::default()
        };
        for job in &stale {
            match self.reconcile_job(job).await {
                Ok(ReconcileOutcome::Applied(_)) => summary.applied += 1,
                Ok(_) => {}
                Err(err) => {
                    summary.failed += 1;
                    warn!(job_id = %job.job_id, error = %err, "reconciliation failed");
                }
            }
        }
        if summary.examined > 0 {
            info!(
                examined = summary.examined,
                applied = summary.applied,
                failed = summary.failed,
                "reconciliation sweep finished"
            );
        }
        Ok(summary)
    }

    /// Forces reconciliation of one job for its owner. Terminal jobs are
    /// returned as they are.
    pub async fn recover(&self, owner: &OwnerId, job_id: &JobId) -> Result<GenerationJob> {
        let job = self.ingestor.ledger().get_owned(owner, job_id).await?;
        if job.is_terminal() {
            return Ok(job);
        }
        match self.reconcile_job(&job).await? {
            ReconcileOutcome::Applied(updated) => Ok(updated),
            ReconcileOutcome::NoProviderId | ReconcileOutcome::Unknown => Ok(job),
        }
    }

    /// Runs sweeps every interval until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.interval_secs,
                stale_after_secs = self.config.stale_after_secs,
                "reconciler started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            warn!(error = %err, "reconciliation sweep failed");
                        }
                    }
                }
            }
            info!("reconciler stopped");
        })
    }
}
