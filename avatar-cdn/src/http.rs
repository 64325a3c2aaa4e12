//! HTTP access to the avatar CDN.
//!
//! [`AssetFetcher`] is the seam between the delivery policy and the
//! network; [`HttpAssetFetcher`] is the production implementation on top of
//! a shared [`reqwest::Client`]. Tests substitute scripted fetchers.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;

use crate::config::CdnConfig;
use crate::error::{DeliveryError, Result};

/// User-Agent sent with every CDN request.
pub const USER_AGENT: &str = concat!("lesson-avatar/", env!("CARGO_PKG_VERSION"));

/// A source of remote avatar assets.
///
/// Implementations classify failures: a missing asset is
/// [`DeliveryError::NotFound`]; connection failures, timeouts and server
/// errors are [`DeliveryError::NetworkTransient`].
///
/// All implementations must be `Send + Sync` so preloads can run
/// concurrently with the tick loop.
pub trait AssetFetcher: Send + Sync {
    /// Download the asset at `url`.
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Bytes>> + Send;

    /// Cheap liveness check against `url`.
    fn probe(&self, url: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Build a [`reqwest::Client`] for CDN traffic.
///
/// # Errors
///
/// Returns [`DeliveryError::Config`] if the client cannot be constructed.
pub fn build_client(config: &CdnConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .connect_timeout(Duration::from_secs(config.timeout_seconds.min(5)))
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| DeliveryError::Config(format!("failed to build HTTP client: {e}")))
}

/// Map a non-success status to the delivery taxonomy.
pub fn classify_status(status: StatusCode, url: &str) -> DeliveryError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        DeliveryError::NetworkTransient(format!("HTTP {status} for {url}"))
    } else {
        // Any other client error is a miss; retrying will not make it appear.
        DeliveryError::NotFound(format!("HTTP {status} for {url}"))
    }
}

fn transport_error(e: reqwest::Error, url: &str) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::NetworkTransient(format!("timeout fetching {url}"))
    } else {
        DeliveryError::NetworkTransient(format!("request to {url} failed: {e}"))
    }
}

/// [`AssetFetcher`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpAssetFetcher {
    client: reqwest::Client,
}

impl HttpAssetFetcher {
    pub fn new(config: &CdnConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
        })
    }

    /// Wrap an existing client, e.g. one shared with the synthesis client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(e, url))?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url, %status, "asset fetch rejected");
            return Err(classify_status(status, url));
        }
        response.bytes().await.map_err(|e| transport_error(e, url))
    }

    async fn probe(&self, url: &str) -> Result<()> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| transport_error(e, url))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DeliveryError::NetworkTransient(format!(
                "health probe returned HTTP {}",
                response.status()
            )))
        }
    }
}
