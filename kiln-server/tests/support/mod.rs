#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Router;
use axum_test::TestServer;
use kiln_core::{
    KilnError,
    ingest::ReconcilerConfig,
    ledger::LedgerConfig,
    provider::{ProviderClient, ProviderConfig, ProviderJobSnapshot, ProviderSubmission},
    realtime::HubConfig,
    retry::RetryPolicy,
    uploads::UploadConfig,
};
use kiln_server::{
    create_app,
    infra::{
        app_state::AppState,
        config::{
            Config, ConfigMetadata, CorsConfig, DatabaseConfig, ServerConfig, StorageConfig,
        },
        startup::Backends,
    },
};
use tempfile::TempDir;

pub const OWNER: &str = "owner-a";
pub const OTHER_OWNER: &str = "owner-b";

/// Provider double: accepts every submission and knows no history.
#[derive(Debug, Default)]
pub struct StubProvider {
    pub submissions: Mutex<Vec<ProviderSubmission>>,
}

#[async_trait]
impl ProviderClient for StubProvider {
    async fn submit(&self, submission: &ProviderSubmission) -> kiln_core::Result<String> {
        let mut seen = self.submissions.lock().unwrap();
        seen.push(submission.clone());
        Ok(format!("prov-{}", seen.len()))
    }

    async fn fetch_output(&self, url: &str) -> kiln_core::Result<Vec<u8>> {
        Err(KilnError::upstream("provider output download", format!("no fixture for {url}")))
    }

    async fn job_history(
        &self,
        _provider_job_id: &str,
    ) -> kiln_core::Result<Option<ProviderJobSnapshot>> {
        Ok(None)
    }
}

#[derive(Debug)]
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub provider: Arc<StubProvider>,
    _tempdir: TempDir,
}

impl TestApp {
    pub fn into_parts(self) -> (Router, AppState, TempDir) {
        (self.router, self.state, self._tempdir)
    }
}

pub fn test_config(storage_root: PathBuf) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            public_url: Some("http://kiln.test".into()),
            body_limit_bytes: 8 * 1024 * 1024,
        },
        database: DatabaseConfig {
            url: None,
            max_connections: 1,
        },
        redis: None,
        storage: StorageConfig {
            root: storage_root,
            max_inline_bytes: 1024,
            part_timeout: Duration::from_secs(10),
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
        },
        provider: ProviderConfig::default(),
        ledger: LedgerConfig::default(),
        reconciler: ReconcilerConfig {
            enabled: false,
            ..ReconcilerConfig::default()
        },
        realtime: HubConfig::default(),
        uploads: UploadConfig::default(),
        cors: CorsConfig {
            allowed_origins: vec!["http://localhost:3000".into()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allowed_headers: ["content-type", "x-owner-id"].map(String::from).to_vec(),
            allow_credentials: false,
        },
        metadata: ConfigMetadata::default(),
    }
}

pub fn build_test_app() -> Result<TestApp> {
    let tempdir = tempfile::tempdir().context("failed to create temporary directory")?;
    let config = test_config(tempdir.path().join("objects"));
    config.ensure_directories()?;

    let provider = Arc::new(StubProvider::default());
    let backends = Backends::in_memory(&config, provider.clone());
    let state = AppState::assemble(Arc::new(config), backends);

    Ok(TestApp {
        router: create_app(state.clone()),
        state,
        provider,
        _tempdir: tempdir,
    })
}

/// Test server over a fresh in-memory app. Keep the tempdir alive for the
/// duration of the test; it holds the object store.
pub fn test_server() -> Result<(TestServer, TestApp)> {
    let app = build_test_app()?;
    let server = TestServer::new(app.router.clone())
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok((server, app))
}
