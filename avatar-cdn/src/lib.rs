//! # avatar-cdn
//!
//! Resilient delivery of avatar images for the lesson player.
//!
//! Avatar assets live on a CDN in three fidelity tiers (full frame
//! sequences, per-viseme mouth shapes, whole-face expressions) with a
//! bundled neutral image as the last resort. This crate decides which of
//! them to show while the network misbehaves.
//!
//! ## Design
//!
//! - [`locator`]: pure `(avatar, key, tier) → URL` mapping that never fails
//! - [`cache`]: bounded LRU of fetched images with request coalescing
//! - [`circuit_breaker`] and [`resilience`]: per-backend breakers and retry
//!   with backoff, shared with the speech-synthesis client
//! - [`policy`]: player-wide tier that degrades on failure and is promoted
//!   only by a health probe; per-tick lookups never wait on the network
//! - [`manifest`]: reader for the deployment's asset manifest
//!
//! ## Failure semantics
//!
//! - A 404 is a miss for one lookup, never a backend failure
//! - Timeouts and server errors are retried, then degrade the tier
//! - The static neutral image is always available

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod http;
pub mod locator;
pub mod manifest;
pub mod policy;
pub mod resilience;
pub mod types;

pub use cache::{CacheStats, FrameCache};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitReport, CircuitState, SharedBreaker};
pub use config::{AvatarAssets, CdnConfig};
pub use error::{DeliveryError, Result};
pub use http::{AssetFetcher, HttpAssetFetcher};
pub use locator::AssetLocator;
pub use manifest::AssetManifest;
pub use policy::{AssetRequest, DeliveryPolicy, DeliverySession};
pub use resilience::{retry_guarded, Backoff, RetryPolicy};
pub use types::{
    AssetHandle, AssetKey, AssetKind, AvatarId, Backend, DeliveryTier, Expression, LoadStatus,
    Viseme,
};

/// Resolve a string-keyed asset with the default configuration.
///
/// Convenience wrapper around [`AssetLocator::resolve_str`].
///
/// # Examples
///
/// ```
/// use avatar_cdn::{AssetKind, DeliveryTier};
///
/// let url = avatar_cdn::resolve("ken", AssetKind::Viseme, "mbp", DeliveryTier::Visemes);
/// assert_eq!(url, "https://cdn.ilearnhow.com/avatars/ken/visemes/MBP.png");
/// ```
pub fn resolve(avatar: &str, kind: AssetKind, key: &str, tier: DeliveryTier) -> String {
    AssetLocator::new(std::sync::Arc::new(CdnConfig::default()))
        .resolve_str(avatar, kind, key, tier)
}

/// Build a policy over the real CDN from `config`.
///
/// # Errors
///
/// Returns [`DeliveryError::Config`] if the configuration is invalid or the
/// HTTP client cannot be built.
pub fn http_policy(
    config: CdnConfig,
    breaker: SharedBreaker,
) -> Result<DeliveryPolicy<HttpAssetFetcher>> {
    config.validate()?;
    let fetcher = HttpAssetFetcher::new(&config)?;
    Ok(DeliveryPolicy::new(
        std::sync::Arc::new(config),
        fetcher,
        breaker,
    ))
}
