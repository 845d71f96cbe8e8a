use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use kiln_core::{
    ingest::ReconcilerConfig, ledger::LedgerConfig, provider::ProviderConfig,
    realtime::HubConfig, uploads::UploadConfig,
};
use thiserror::Error;

use super::{
    models::{
        Config, ConfigMetadata, CorsConfig, DatabaseConfig, RedisConfig, ServerConfig,
        StorageConfig,
    },
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["kiln.toml", "config/kiln.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Composes configuration from, in order of precedence, environment
/// variables, a TOML file and built-in defaults. CLI flags are applied by the
/// caller on top of the result.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path)
                .map(|_| true)
                .or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?,
            None => dotenvy::dotenv()
                .map(|_| true)
                .or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?,
        };

        let env_config = EnvConfig::gather();

        let (file_config, config_path, config_present) = self.load_file_config(&env_config)?;

        let (config, warnings) = self.compose_config(
            file_config,
            env_config,
            config_path,
            env_file_loaded,
            config_present,
        )?;

        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>, bool), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env_config.config_path {
            source.env = Some(from_env.clone());
        }

        if source.is_empty() {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists());
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None, false));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None, false));
        }

        let contents = fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
            path: path.clone(),
            source: err,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;

        Ok((Some(file_config), Some(path), true))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
        config_present: bool,
    ) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if !config_present {
            warnings.push_with_hint(
                "No kiln.toml detected; using environment variables and defaults",
                "Create kiln.toml or pass --config to pin the service configuration",
            );
        }

        let FileConfig {
            server: file_server,
            database: file_database,
            redis: file_redis,
            storage: file_storage,
            provider: file_provider,
            ledger: file_ledger,
            reconciler: file_reconciler,
            realtime: file_realtime,
            uploads: file_uploads,
            cors: file_cors,
        } = file_config.unwrap_or_default();

        let server = ServerConfig {
            host: env
                .server_host
                .or(file_server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.server_port.or(file_server.port).unwrap_or(8080),
            public_url: non_empty(env.public_url.or(file_server.public_url)),
            body_limit_bytes: env
                .body_limit_bytes
                .or(file_server.body_limit_bytes)
                .unwrap_or(64 * 1024 * 1024),
        };

        let database = DatabaseConfig {
            url: non_empty(env.database_url.or(file_database.url)),
            max_connections: env
                .database_max_connections
                .or(file_database.max_connections)
                .unwrap_or(10),
        };

        let redis_prefix = env.redis_key_prefix;
        let redis = match non_empty(env.redis_url) {
            Some(url) => Some(RedisConfig {
                url,
                key_prefix: redis_prefix
                    .or_else(|| file_redis.as_ref().and_then(|r| r.key_prefix.clone()))
                    .unwrap_or_else(default_redis_prefix),
            }),
            None => file_redis
                .filter(|r| !r.url.trim().is_empty())
                .map(|r| RedisConfig {
                    url: r.url,
                    key_prefix: redis_prefix
                        .or(r.key_prefix)
                        .unwrap_or_else(default_redis_prefix),
                }),
        };

        let storage = StorageConfig {
            root: env
                .storage_root
                .or(file_storage.root)
                .unwrap_or_else(|| PathBuf::from("./data/objects")),
            max_inline_bytes: env
                .max_inline_bytes
                .or(file_storage.max_inline_bytes)
                .unwrap_or(16 * 1024 * 1024),
            part_timeout: duration(
                "storage.part_timeout",
                env.part_timeout.or(file_storage.part_timeout),
                Duration::from_secs(600),
            )?,
            retry: file_storage.retry.unwrap_or_default(),
        };

        let provider_defaults = ProviderConfig::default();
        let provider = ProviderConfig {
            base_url: env
                .provider_url
                .or(file_provider.base_url)
                .unwrap_or(provider_defaults.base_url),
            api_key: non_empty(env.provider_api_key.or(file_provider.api_key)),
            callback_url: non_empty(env.provider_callback_url.or(file_provider.callback_url)),
            request_timeout_secs: duration(
                "provider.request_timeout",
                env.provider_request_timeout.or(file_provider.request_timeout),
                Duration::from_secs(provider_defaults.request_timeout_secs),
            )?
            .as_secs(),
            download_timeout_secs: duration(
                "provider.download_timeout",
                env.provider_download_timeout
                    .or(file_provider.download_timeout),
                Duration::from_secs(provider_defaults.download_timeout_secs),
            )?
            .as_secs(),
            retry: file_provider.retry.unwrap_or_default(),
        };

        let ledger_defaults = LedgerConfig::default();
        let retention = duration(
            "ledger.retention",
            env.ledger_retention.or(file_ledger.retention),
            Duration::from_secs(u64::from(ledger_defaults.retention_hours) * 3600),
        )?;
        let ledger = LedgerConfig {
            retention_hours: u32::try_from(retention.as_secs().div_ceil(3600))
                .unwrap_or(u32::MAX),
            list_limit: file_ledger.list_limit.unwrap_or(ledger_defaults.list_limit),
            ..ledger_defaults
        };

        let reconciler_defaults = ReconcilerConfig::default();
        let reconciler = ReconcilerConfig {
            enabled: env
                .reconciler_enabled
                .or(file_reconciler.enabled)
                .unwrap_or(reconciler_defaults.enabled),
            interval_secs: duration(
                "reconciler.interval",
                env.reconciler_interval.or(file_reconciler.interval),
                reconciler_defaults.interval(),
            )?
            .as_secs(),
            stale_after_secs: duration(
                "reconciler.stale_after",
                env.reconciler_stale_after.or(file_reconciler.stale_after),
                reconciler_defaults.stale_after(),
            )?
            .as_secs(),
            batch_size: file_reconciler
                .batch_size
                .unwrap_or(reconciler_defaults.batch_size),
        };

        let realtime = HubConfig {
            subscriber_capacity: env
                .subscriber_capacity
                .or(file_realtime.subscriber_capacity)
                .unwrap_or(HubConfig::default().subscriber_capacity),
        };

        let upload_defaults = UploadConfig::default();
        let uploads = UploadConfig {
            max_total_chunks: file_uploads
                .max_total_chunks
                .unwrap_or(upload_defaults.max_total_chunks),
            session_ttl_secs: duration(
                "uploads.session_ttl",
                env.upload_session_ttl.or(file_uploads.session_ttl),
                Duration::from_secs(upload_defaults.session_ttl_secs),
            )?
            .as_secs(),
            tombstone_ttl_secs: duration(
                "uploads.tombstone_ttl",
                file_uploads.tombstone_ttl,
                Duration::from_secs(upload_defaults.tombstone_ttl_secs),
            )?
            .as_secs(),
            object_prefix: file_uploads
                .object_prefix
                .unwrap_or(upload_defaults.object_prefix),
        };

        let cors = CorsConfig {
            allowed_origins: env
                .cors_allowed_origins
                .or(file_cors.allowed_origins)
                .unwrap_or_else(default_cors_origins),
            allowed_methods: env
                .cors_allowed_methods
                .or(file_cors.allowed_methods)
                .unwrap_or_else(default_cors_methods),
            allowed_headers: env
                .cors_allowed_headers
                .or(file_cors.allowed_headers)
                .unwrap_or_else(default_cors_headers),
            allow_credentials: env
                .cors_allow_credentials
                .or(file_cors.allow_credentials)
                .unwrap_or(false),
        };

        let config = Config {
            server,
            database,
            redis,
            storage,
            provider,
            ledger,
            reconciler,
            realtime,
            uploads,
            cors,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        };

        warnings.extend(validation::apply_guard_rails(&config)?);

        Ok((config, warnings))
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration for {key}: '{value}'")]
    InvalidDuration {
        key: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn is_empty(&self) -> bool {
        self.explicit.is_none() && self.env.is_none() && self.default.is_none()
    }

    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        if let Some(path) = &self.default {
            return Some((path.clone(), ConfigPathProvenance::Default));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(self, ConfigPathProvenance::Explicit | ConfigPathProvenance::Env)
    }
}

fn duration(
    key: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match raw.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(value) => humantime::parse_duration(value).map_err(|source| {
            ConfigLoadError::InvalidDuration {
                key,
                value: value.to_string(),
                source,
            }
        }),
        None => Ok(default),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn default_redis_prefix() -> String {
    "kiln".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_cors_headers() -> Vec<String> {
    ["Authorization", "Content-Type", "X-Owner-Id"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoad {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.metadata.config_path.as_deref()
    }
}
