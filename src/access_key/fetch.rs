//! Transport config fetching for dynamic access keys

use crate::config::FetchConfig;
use crate::error::{Result, ServerApiError, VpnError};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// Retrieves the body served at a dynamic key's config location.
///
/// Implementations perform a single attempt; retry policy belongs to the
/// caller.
#[async_trait]
pub trait ConfigFetcher: Send + Sync {
    async fn fetch(&self, location: &Url) -> Result<String>;
}

/// HTTPS fetcher backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpConfigFetcher {
    http_client: Client,
}

impl HttpConfigFetcher {
    /// Create a fetcher with the given request timeout
    pub fn new(config: &FetchConfig, timeout: Duration) -> Result<Self> {
        let mut client_builder = Client::builder()
            .timeout(timeout)
            .user_agent(config.user_agent.clone());

        if config.accept_invalid_certs {
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        let http_client = client_builder
            .build()
            .map_err(|e| VpnError::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl ConfigFetcher for HttpConfigFetcher {
    async fn fetch(&self, location: &Url) -> Result<String> {
        log::debug!("Fetching transport config from {}", location.host_str().unwrap_or("?"));

        let response = self
            .http_client
            .get(location.clone())
            .send()
            .await
            .map_err(|e| ServerApiError::NoResponse {
                url: location.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("Config server answered {} for {}", status, location);
            return Err(ServerApiError::BadStatus {
                url: location.to_string(),
                status: status.as_u16(),
            }
            .into());
        }

        let body = response.text().await.map_err(|e| ServerApiError::NoResponse {
            url: location.to_string(),
            message: e.to_string(),
        })?;
        Ok(body)
    }
}
