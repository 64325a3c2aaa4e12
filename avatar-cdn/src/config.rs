//! Delivery configuration with sensible defaults.
//!
//! [`CdnConfig`] controls where assets live, how frame sequences are laid
//! out per avatar, the frame cache size, and the retry / circuit breaker
//! policy. It is built once at start-up and shared immutably.

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::DeliveryError;
use crate::resilience::RetryPolicy;
use crate::types::{AvatarId, DeliveryTier};

/// Frame-sequence layout for one avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarAssets {
    /// Number of frames in the continuous sequence.
    pub total_frames: u32,
    /// Native frame rate of the sequence.
    pub frame_rate: u32,
}

impl Default for AvatarAssets {
    fn default() -> Self {
        Self {
            total_frames: 365,
            frame_rate: 30,
        }
    }
}

/// Configuration for avatar asset delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CdnConfig {
    /// Root of the CDN asset tree; avatars live under `{cdn_base_url}/{avatar}/`.
    pub cdn_base_url: String,
    /// Root of the bundled assets served by the static file server. The
    /// static-neutral tier is always resolved here, never on the CDN.
    pub local_base_url: String,
    /// File extension of full-sequence frames.
    pub frame_format: String,
    /// File extension of viseme images.
    pub image_format: String,
    pub kelly: AvatarAssets,
    pub ken: AvatarAssets,
    /// Per-request HTTP timeout in seconds.
    pub timeout_seconds: u64,
    /// Frame cache capacity in entries.
    pub cache_capacity: usize,
    /// How many frames ahead of the play cursor to preload.
    pub preload_ahead: u32,
    /// Seconds between background health probes. 0 disables probing.
    pub health_probe_interval_secs: u64,
    /// Tier a fresh player starts at.
    pub initial_tier: DeliveryTier,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            cdn_base_url: "https://cdn.ilearnhow.com/avatars".to_owned(),
            local_base_url: "/production-deploy/assets/avatars".to_owned(),
            frame_format: "png".to_owned(),
            image_format: "png".to_owned(),
            kelly: AvatarAssets {
                total_frames: 365,
                frame_rate: 30,
            },
            ken: AvatarAssets {
                total_frames: 347,
                frame_rate: 30,
            },
            timeout_seconds: 8,
            cache_capacity: 100,
            preload_ahead: 10,
            health_probe_interval_secs: 60,
            initial_tier: DeliveryTier::FullFrames,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl CdnConfig {
    /// Frame layout for the given avatar.
    pub fn avatar(&self, avatar: AvatarId) -> &AvatarAssets {
        match avatar {
            AvatarId::Kelly => &self.kelly,
            AvatarId::Ken => &self.ken,
        }
    }

    /// Validates this configuration, returning an error if any field is invalid.
    ///
    /// Checks:
    /// - `cdn_base_url` must be an absolute URL
    /// - `local_base_url` must not be empty
    /// - `cache_capacity` and `timeout_seconds` must be greater than 0
    /// - every avatar must have at least one frame
    /// - retry attempts and the failure threshold must be at least 1
    pub fn validate(&self) -> Result<(), DeliveryError> {
        url::Url::parse(&self.cdn_base_url)
            .map_err(|e| DeliveryError::Config(format!("cdn_base_url is not a URL: {e}")))?;
        if self.local_base_url.trim().is_empty() {
            return Err(DeliveryError::Config(
                "local_base_url must not be empty".into(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(DeliveryError::Config(
                "cache_capacity must be greater than 0".into(),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(DeliveryError::Config(
                "timeout_seconds must be greater than 0".into(),
            ));
        }
        for avatar in AvatarId::all() {
            if self.avatar(*avatar).total_frames == 0 {
                return Err(DeliveryError::Config(format!(
                    "total_frames for {avatar} must be greater than 0"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(DeliveryError::Config(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(DeliveryError::Config(
                "failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
