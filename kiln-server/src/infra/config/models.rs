use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use kiln_core::{
    artifacts::ArtifactConfig, ingest::ReconcilerConfig, ledger::LedgerConfig,
    provider::ProviderConfig, realtime::HubConfig, retry::RetryPolicy, uploads::UploadConfig,
};

/// Path of the provider webhook relative to the public base URL.
pub const CALLBACK_PATH: &str = "/api/v1/callbacks/provider";

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub storage: StorageConfig,
    pub provider: ProviderConfig,
    pub ledger: LedgerConfig,
    pub reconciler: ReconcilerConfig,
    pub realtime: HubConfig,
    pub uploads: UploadConfig,
    pub cors: CorsConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// URL the provider should post job events to, if one can be derived.
    pub fn callback_url(&self) -> Option<String> {
        self.provider.callback_url.clone().or_else(|| {
            self.server
                .public_url
                .as_deref()
                .map(|base| format!("{}{}", base.trim_end_matches('/'), CALLBACK_PATH))
        })
    }

    pub fn artifact_config(&self) -> ArtifactConfig {
        ArtifactConfig {
            max_inline_bytes: self.storage.max_inline_bytes,
        }
    }

    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.storage.root)?;
        Ok(())
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage.root
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, used to derive the callback URL.
    pub public_url: Option<String>,
    /// Upper bound for request bodies (chunk and part uploads included).
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// `None` runs the ledger on in-process repositories.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Root of the on-disk object store.
    pub root: PathBuf,
    pub max_inline_bytes: usize,
    /// Bound for a single multipart part write.
    pub part_timeout: Duration,
    /// Retry policy for object store writes.
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
}

impl CorsConfig {
    pub fn is_wildcard_included(&self) -> bool {
        self.allowed_origins.iter().any(|origin| origin == "*")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
