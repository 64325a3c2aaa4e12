//! Error types for the avatar-cdn crate.
//!
//! Most of these never reach a lesson player caller: the delivery policy
//! absorbs them into retry and tier-fallback decisions. They surface only
//! from the lower-level fetch and configuration APIs.

use crate::types::Backend;

/// Errors that can occur while delivering avatar assets or calling a guarded backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// A fetch or timeout failure that is worth retrying.
    #[error("network error: {0}")]
    NetworkTransient(String),

    /// The backend answered 404 for this asset.
    #[error("asset not found: {0}")]
    NotFound(String),

    /// The backend's circuit is open; the call was not attempted.
    #[error("circuit open for {0}")]
    CircuitOpen(Backend),

    /// Retries were exhausted for the given backend.
    #[error("{backend} unavailable after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        backend: Backend,
        attempts: u32,
        last_error: String,
    },

    /// The backend refused the request itself (bad input, unsupported
    /// voice). Retrying the same request cannot succeed.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// No tier could produce a URL for the asset, not even the local default.
    #[error("asset unresolvable: {0}")]
    AssetUnresolvable(String),

    /// The operation was cancelled because its session ended.
    #[error("cancelled")]
    Cancelled,

    /// Malformed manifest or other payload.
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid delivery configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl DeliveryError {
    /// Whether this failure should count against the backend's circuit.
    ///
    /// A 404 is a resolvable miss and cancellation is not the backend's fault.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            Self::NetworkTransient(_) | Self::RetriesExhausted { .. }
        )
    }

    /// Whether the retry loop should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkTransient(_))
    }
}

/// Convenience type alias for avatar-cdn results.
pub type Result<T> = std::result::Result<T, DeliveryError>;
