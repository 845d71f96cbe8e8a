use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::{ProviderClient, ProviderConfig, ProviderJobSnapshot, ProviderSubmission};
use crate::error::{KilnError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    provider_job_id: String,
}

/// JSON-over-HTTP provider client.
#[derive(Clone)]
pub struct HttpProviderClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    request_timeout: Duration,
    download_timeout: Duration,
}

impl fmt::Debug for HttpProviderClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProviderClient")
            .field("base_url", &self.base_url.as_str())
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

impl HttpProviderClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            KilnError::InvalidInput(format!("invalid provider url {}: {e}", config.base_url))
        })?;
        let request_timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| KilnError::Internal(format!("failed to create HTTP client: {e}")))?;

        info!("Provider client targeting {}", base_url);
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            request_timeout,
            download_timeout: Duration::from_secs(config.download_timeout_secs.max(1)),
        })
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| KilnError::InvalidInput(format!("invalid provider path {path}: {e}")))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(
        &self,
        operation: &str,
        builder: RequestBuilder,
        limit: Duration,
    ) -> Result<Response> {
        let response = self
            .authorize(builder.timeout(limit))
            .send()
            .await
            .map_err(|e| transport_error(operation, limit, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(status_error(operation, status, body))
    }
}

fn transport_error(operation: &str, limit: Duration, err: reqwest::Error) -> KilnError {
    if err.is_timeout() {
        KilnError::UpstreamTimeout {
            operation: operation.to_string(),
            after: limit,
        }
    } else {
        KilnError::upstream(operation, err)
    }
}

/// 5xx and 429 are worth another attempt; other client errors are not.
fn status_error(operation: &str, status: StatusCode, body: String) -> KilnError {
    let message = format!("provider answered {status}: {body}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        KilnError::upstream(operation, message)
    } else if status == StatusCode::NOT_FOUND {
        KilnError::not_found("provider resource", operation.to_string())
    } else {
        KilnError::InvalidInput(message)
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn submit(&self, submission: &ProviderSubmission) -> Result<String> {
        let url = self.resolve("jobs")?;
        let response = self
            .send(
                "provider submit",
                self.client.post(url).json(submission),
                self.request_timeout,
            )
            .await?;
        let accepted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| KilnError::upstream("provider submit", e))?;
        debug!(
            job_id = %submission.job_id,
            provider_job_id = %accepted.provider_job_id,
            "provider accepted job"
        );
        Ok(accepted.provider_job_id)
    }

    async fn fetch_output(&self, url: &str) -> Result<Vec<u8>> {
        let url = self.resolve(url)?;
        let response = self
            .send(
                "provider output download",
                self.client.get(url),
                self.download_timeout,
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error("provider output download", self.download_timeout, e))?;
        Ok(bytes.to_vec())
    }

    async fn job_history(&self, provider_job_id: &str) -> Result<Option<ProviderJobSnapshot>> {
        let url = self.resolve(&format!("history/{provider_job_id}"))?;
        match self
            .send("provider history", self.client.get(url), self.request_timeout)
            .await
        {
            Ok(response) => {
                let snapshot = response
                    .json()
                    .await
                    .map_err(|e| KilnError::upstream("provider history", e))?;
                Ok(Some(snapshot))
            }
            Err(KilnError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_split_retryable_from_fatal() {
        assert!(status_error("op", StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(status_error("op", StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(!status_error("op", StatusCode::BAD_REQUEST, String::new()).is_retryable());
        assert!(matches!(
            status_error("op", StatusCode::NOT_FOUND, String::new()),
            KilnError::NotFound { .. }
        ));
    }

    #[test]
    fn relative_urls_resolve_against_provider() {
        let client = HttpProviderClient::new(&ProviderConfig {
            base_url: "http://provider.local/api/".into(),
            ..ProviderConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.resolve("view/a.png").unwrap().as_str(),
            "http://provider.local/api/view/a.png"
        );
        assert_eq!(
            client.resolve("https://cdn.example/x.png").unwrap().as_str(),
            "https://cdn.example/x.png"
        );
    }
}
