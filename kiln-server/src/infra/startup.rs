use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use kiln_core::{
    artifacts::ArtifactStoreAdapter,
    ingest::{CallbackIngestor, Reconciler},
    ledger::JobLedger,
    persistence::{
        ArtifactRepository, InMemoryArtifactRepository, InMemoryJobRepository, JobRepository,
        PostgresArtifactRepository, PostgresJobRepository,
    },
    provider::{HttpProviderClient, ProviderClient},
    realtime::FanoutHub,
    storage::{CacacheObjectStore, ObjectStore},
    submission::SubmissionService,
    uploads::{
        ChunkReassemblyService, ChunkSessionStore, InMemoryChunkSessionStore,
        InMemoryMultipartSessionStore, LedgerRegistrar, MultipartSessionStore,
        MultipartUploadOrchestrator, RedisChunkSessionStore, RedisMultipartSessionStore,
        UploadRegistrar, redis_sessions,
    },
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::infra::{app_state::AppState, config::Config};

/// Object key prefix for provider outputs too large to keep inline.
const GENERATED_OBJECT_PREFIX: &str = "generated";

/// Storage and provider seams the services are built on.
#[derive(Debug, Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobRepository>,
    pub artifacts: Arc<dyn ArtifactRepository>,
    pub chunk_sessions: Arc<dyn ChunkSessionStore>,
    pub multipart_sessions: Arc<dyn MultipartSessionStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub provider: Arc<dyn ProviderClient>,
    pub postgres: Option<PgPool>,
    pub shared_sessions: bool,
}

impl Backends {
    /// Process-local repositories and session stores.
    pub fn in_memory(config: &Config, provider: Arc<dyn ProviderClient>) -> Self {
        Self {
            jobs: Arc::new(InMemoryJobRepository::new()),
            artifacts: Arc::new(InMemoryArtifactRepository::new()),
            chunk_sessions: Arc::new(InMemoryChunkSessionStore::new(
                Duration::from_secs(config.uploads.session_ttl_secs),
                Duration::from_secs(config.uploads.tombstone_ttl_secs),
            )),
            multipart_sessions: Arc::new(InMemoryMultipartSessionStore::new(
                Duration::from_secs(config.uploads.session_ttl_secs),
            )),
            objects: Arc::new(CacacheObjectStore::new(config.storage.root.clone())),
            provider,
            postgres: None,
            shared_sessions: false,
        }
    }

    /// Connects whatever the configuration names; anything left unconfigured
    /// falls back to the in-memory implementation.
    pub async fn connect(config: &Config) -> Result<Self> {
        let provider = HttpProviderClient::new(&config.provider)
            .context("failed to create provider client")?;
        let mut backends = Self::in_memory(config, Arc::new(provider));

        if let Some(url) = &config.database.url {
            let pool = connect_postgres(url, config.database.max_connections).await?;
            kiln_core::MIGRATOR
                .run(&pool)
                .await
                .context("database migration failed")?;
            info!("Database migrations applied");
            backends.jobs = Arc::new(PostgresJobRepository::new(pool.clone()));
            backends.artifacts = Arc::new(PostgresArtifactRepository::new(pool.clone()));
            backends.postgres = Some(pool);
        }

        if let Some(redis) = &config.redis {
            let conn = redis_sessions::connect(&redis.url)
                .await
                .context("failed to connect to Redis")?;
            let session_ttl = Duration::from_secs(config.uploads.session_ttl_secs);
            backends.chunk_sessions = Arc::new(RedisChunkSessionStore::new(
                conn.clone(),
                redis.key_prefix.clone(),
                session_ttl,
                Duration::from_secs(config.uploads.tombstone_ttl_secs),
            ));
            backends.multipart_sessions = Arc::new(RedisMultipartSessionStore::new(
                conn,
                redis.key_prefix.clone(),
                session_ttl,
            ));
            backends.shared_sessions = true;
        }

        Ok(backends)
    }
}

pub async fn connect_postgres(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")
}

impl AppState {
    /// Builds the service graph over `backends`.
    pub fn assemble(config: Arc<Config>, backends: Backends) -> Self {
        let hub = FanoutHub::new(config.realtime.clone());
        let ledger = Arc::new(JobLedger::new(backends.jobs, hub, config.ledger.clone()));
        let artifacts = Arc::new(ArtifactStoreAdapter::new(
            backends.artifacts,
            config.artifact_config(),
        ));

        let ingestor = Arc::new(CallbackIngestor::new(
            Arc::clone(&ledger),
            Arc::clone(&artifacts),
            Arc::clone(&backends.objects),
            Arc::clone(&backends.provider),
            config.provider.download_retry(),
            config.storage.retry.clone(),
            GENERATED_OBJECT_PREFIX,
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&ingestor),
            Arc::clone(&backends.provider),
            config.reconciler.clone(),
        ));
        let submissions = Arc::new(SubmissionService::new(
            Arc::clone(&ledger),
            Arc::clone(&backends.provider),
            config.callback_url(),
        ));

        let registrar: Arc<dyn UploadRegistrar> = Arc::new(LedgerRegistrar::new(
            Arc::clone(&ledger),
            Arc::clone(&artifacts),
            Arc::clone(&backends.objects),
            config.storage.retry.clone(),
            config.uploads.object_prefix.clone(),
        ));
        let chunks = Arc::new(ChunkReassemblyService::new(
            backends.chunk_sessions,
            Arc::clone(&registrar),
            config.uploads.max_total_chunks,
        ));
        let multipart = Arc::new(MultipartUploadOrchestrator::new(
            backends.multipart_sessions,
            Arc::clone(&backends.objects),
            registrar,
            config.uploads.object_prefix.clone(),
            config.storage.part_timeout,
        ));

        Self {
            config,
            ledger,
            artifacts,
            ingestor,
            reconciler,
            submissions,
            chunks,
            multipart,
            objects: backends.objects,
            postgres: backends.postgres,
            shared_sessions: backends.shared_sessions,
            shutdown: CancellationToken::new(),
        }
    }
}
