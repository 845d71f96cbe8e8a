use std::{fmt, sync::Arc};

use kiln_core::{
    artifacts::ArtifactStoreAdapter,
    ingest::{CallbackIngestor, Reconciler},
    ledger::JobLedger,
    realtime::FanoutHub,
    storage::ObjectStore,
    submission::SubmissionService,
    uploads::{ChunkReassemblyService, MultipartUploadOrchestrator},
};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Arc<JobLedger>,
    pub artifacts: Arc<ArtifactStoreAdapter>,
    pub ingestor: Arc<CallbackIngestor>,
    pub reconciler: Arc<Reconciler>,
    pub submissions: Arc<SubmissionService>,
    pub chunks: Arc<ChunkReassemblyService>,
    pub multipart: Arc<MultipartUploadOrchestrator>,
    pub objects: Arc<dyn ObjectStore>,
    /// Present when the ledger is backed by Postgres.
    pub postgres: Option<PgPool>,
    pub shared_sessions: bool,
    /// Cancelled when the server starts shutting down; ends live feeds.
    pub shutdown: CancellationToken,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &FanoutHub {
        self.ledger.hub()
    }
}
