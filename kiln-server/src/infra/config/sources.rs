use std::path::PathBuf;

use kiln_core::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Raw configuration as defined in a TOML file. Durations are humantime
/// strings such as `"90s"` or `"24h"`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub provider: FileProviderConfig,
    #[serde(default)]
    pub ledger: FileLedgerConfig,
    #[serde(default)]
    pub reconciler: FileReconcilerConfig,
    #[serde(default)]
    pub realtime: FileRealtimeConfig,
    #[serde(default)]
    pub uploads: FileUploadsConfig,
    #[serde(default)]
    pub cors: FileCorsConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_limit_bytes: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_inline_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLedgerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_limit: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileReconcilerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRealtimeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_capacity: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileUploadsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_chunks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tombstone_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_prefix: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCorsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_methods: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_headers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_credentials: Option<bool>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub public_url: Option<String>,
    pub body_limit_bytes: Option<usize>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub redis_url: Option<String>,
    pub redis_key_prefix: Option<String>,
    pub storage_root: Option<PathBuf>,
    pub max_inline_bytes: Option<usize>,
    pub part_timeout: Option<String>,
    pub provider_url: Option<String>,
    pub provider_api_key: Option<String>,
    pub provider_callback_url: Option<String>,
    pub provider_request_timeout: Option<String>,
    pub provider_download_timeout: Option<String>,
    pub ledger_retention: Option<String>,
    pub reconciler_enabled: Option<bool>,
    pub reconciler_interval: Option<String>,
    pub reconciler_stale_after: Option<String>,
    pub upload_session_ttl: Option<String>,
    pub subscriber_capacity: Option<usize>,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub cors_allowed_methods: Option<Vec<String>>,
    pub cors_allowed_headers: Option<Vec<String>>,
    pub cors_allow_credentials: Option<bool>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        let mut env_config = Self::default();

        env_config.config_path = std::env::var("KILN_CONFIG_PATH").ok().map(PathBuf::from);
        env_config.server_host = std::env::var("SERVER_HOST").ok();
        env_config.server_port = parse_var("SERVER_PORT");
        env_config.public_url = std::env::var("KILN_PUBLIC_URL").ok();
        env_config.body_limit_bytes = parse_var("KILN_BODY_LIMIT_BYTES");

        env_config.database_url = std::env::var("DATABASE_URL").ok();
        env_config.database_max_connections = parse_var("DATABASE_MAX_CONNECTIONS");
        env_config.redis_url = std::env::var("REDIS_URL").ok();
        env_config.redis_key_prefix = std::env::var("REDIS_KEY_PREFIX").ok();

        env_config.storage_root = std::env::var("STORAGE_ROOT").ok().map(PathBuf::from);
        env_config.max_inline_bytes = parse_var("MAX_INLINE_BYTES");
        env_config.part_timeout = std::env::var("PART_UPLOAD_TIMEOUT").ok();

        env_config.provider_url = std::env::var("PROVIDER_URL").ok();
        env_config.provider_api_key = std::env::var("PROVIDER_API_KEY").ok();
        env_config.provider_callback_url = std::env::var("PROVIDER_CALLBACK_URL").ok();
        env_config.provider_request_timeout = std::env::var("PROVIDER_REQUEST_TIMEOUT").ok();
        env_config.provider_download_timeout = std::env::var("PROVIDER_DOWNLOAD_TIMEOUT").ok();

        env_config.ledger_retention = std::env::var("LEDGER_RETENTION").ok();
        env_config.reconciler_enabled = parse_bool_var("RECONCILER_ENABLED");
        env_config.reconciler_interval = std::env::var("RECONCILER_INTERVAL").ok();
        env_config.reconciler_stale_after = std::env::var("RECONCILER_STALE_AFTER").ok();
        env_config.upload_session_ttl = std::env::var("UPLOAD_SESSION_TTL").ok();
        env_config.subscriber_capacity = parse_var("REALTIME_SUBSCRIBER_CAPACITY");

        env_config.cors_allowed_origins = parse_csv_var("CORS_ALLOWED_ORIGINS");
        env_config.cors_allowed_methods = parse_csv_var("CORS_ALLOWED_METHODS");
        env_config.cors_allowed_headers = parse_csv_var("CORS_ALLOWED_HEADERS");
        env_config.cors_allow_credentials = parse_bool_var("CORS_ALLOW_CREDENTIALS");

        env_config
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_csv_var(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|raw| {
        raw.split(',')
            .filter_map(|part| {
                let trimmed = part.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect()
    })
}

fn parse_bool_var(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .and_then(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}
