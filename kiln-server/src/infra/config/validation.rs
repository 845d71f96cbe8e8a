use axum::http::{HeaderName, Method};
use thiserror::Error;
use url::Url;

use super::models::{Config, CorsConfig};

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("CORS wildcard origin cannot be combined with credentials")]
    CredentialedCorsWildcard,
    #[error("invalid CORS method '{0}'")]
    InvalidCorsMethod(String),
    #[error("invalid CORS header '{0}'")]
    InvalidCorsHeader(String),
    #[error("invalid {field} URL '{value}'")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    validate_cors(&config.cors)?;
    validate_url("provider", &config.provider.base_url)?;
    if let Some(public_url) = &config.server.public_url {
        validate_url("public", public_url)?;
    }

    if config.storage.max_inline_bytes == 0 {
        return Err(ConfigGuardRailError::ZeroLimit("storage.max_inline_bytes"));
    }
    if config.uploads.max_total_chunks == 0 {
        return Err(ConfigGuardRailError::ZeroLimit("uploads.max_total_chunks"));
    }
    if config.realtime.subscriber_capacity == 0 {
        return Err(ConfigGuardRailError::ZeroLimit(
            "realtime.subscriber_capacity",
        ));
    }

    if config.database.url.is_none() {
        warnings.push_with_hint(
            "No database configured; jobs and artifacts are kept in memory and lost on restart",
            "Set DATABASE_URL or [database].url to persist the ledger",
        );
    }

    if config.redis.is_none() {
        warnings.push_with_hint(
            "No Redis configured; upload sessions are process-local",
            "Set REDIS_URL when running more than one instance",
        );
    }

    if config.callback_url().is_none() {
        warnings.push_with_hint(
            "No callback URL configured; provider progress relies on reconciliation",
            "Set KILN_PUBLIC_URL or PROVIDER_CALLBACK_URL",
        );
    }

    if config.reconciler.enabled
        && config.reconciler.stale_after_secs < config.reconciler.interval_secs
    {
        warnings.push(format!(
            "reconciler stale threshold ({}s) is shorter than its interval ({}s); \
             jobs may be polled while callbacks are still arriving",
            config.reconciler.stale_after_secs, config.reconciler.interval_secs
        ));
    }

    Ok(warnings)
}

fn validate_cors(cors: &CorsConfig) -> Result<(), ConfigGuardRailError> {
    if cors.allow_credentials && cors.is_wildcard_included() {
        return Err(ConfigGuardRailError::CredentialedCorsWildcard);
    }
    for method in &cors.allowed_methods {
        Method::from_bytes(method.as_bytes())
            .map_err(|_| ConfigGuardRailError::InvalidCorsMethod(method.clone()))?;
    }
    for header in &cors.allowed_headers {
        HeaderName::from_bytes(header.as_bytes())
            .map_err(|_| ConfigGuardRailError::InvalidCorsHeader(header.clone()))?;
    }
    Ok(())
}

fn validate_url(field: &'static str, value: &str) -> Result<(), ConfigGuardRailError> {
    Url::parse(value)
        .map(|_| ())
        .map_err(|source| ConfigGuardRailError::InvalidUrl {
            field,
            value: value.to_string(),
            source,
        })
}
