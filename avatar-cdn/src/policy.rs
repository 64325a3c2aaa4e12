//! Tiered asset delivery.
//!
//! The [`DeliveryPolicy`] owns the locator, the frame cache, the shared
//! circuit breaker and the fetcher, plus the player-wide delivery tier.
//!
//! # Tier rules
//!
//! - The tier only moves down on its own: when the backend its lookups land
//!   on is unavailable (circuit open or retries exhausted) the tier degrades
//!   one step per tier that shares that backend. A phoneme lookup at
//!   `FullFrames` lands on the viseme backend, so a viseme outage takes it
//!   to `Expressions`. `StaticNeutral` is never fetched remotely.
//! - Handles and placements carry the tier that actually served them.
//! - The tier only moves up through a successful health probe, one step per
//!   probe.
//! - A 404 is a miss for that one lookup: it falls through to the next tier
//!   without retrying, without counting against the circuit, and without
//!   touching the player-wide tier.
//!
//! # Ticks never wait
//!
//! [`DeliverySession::frame_for`] answers from the cache or, on a miss,
//! starts a background resolution and returns the last frame it served
//! (or a pending placeholder).

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, FrameCache};
use crate::circuit_breaker::{CircuitReport, SharedBreaker};
use crate::config::CdnConfig;
use crate::error::{DeliveryError, Result};
use crate::http::AssetFetcher;
use crate::locator::AssetLocator;
use crate::resilience::retry_guarded;
use crate::types::{AssetHandle, AssetKey, AvatarId, Backend, DeliveryTier, Expression, Viseme};

/// What the renderer wants to show for one tick.
///
/// The policy picks the most detailed part the current tier can serve:
/// the frame at `FullFrames`, the viseme at `Visemes`, the expression at
/// `Expressions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetRequest {
    pub avatar: AvatarId,
    pub frame: Option<u32>,
    pub viseme: Option<Viseme>,
    pub expression: Expression,
}

impl AssetRequest {
    pub fn frame(avatar: AvatarId, index: u32, viseme: Viseme, expression: Expression) -> Self {
        Self {
            avatar,
            frame: Some(index),
            viseme: Some(viseme),
            expression,
        }
    }

    pub fn viseme(avatar: AvatarId, viseme: Viseme, expression: Expression) -> Self {
        Self {
            avatar,
            frame: None,
            viseme: Some(viseme),
            expression,
        }
    }

    pub fn expression(avatar: AvatarId, expression: Expression) -> Self {
        Self {
            avatar,
            frame: None,
            viseme: None,
            expression,
        }
    }

    /// The key to ask for when serving at `tier`.
    pub fn key_for(&self, tier: DeliveryTier) -> AssetKey {
        let expression = AssetKey::Expression(self.expression);
        match tier {
            DeliveryTier::FullFrames => self
                .frame
                .map(AssetKey::Frame)
                .or(self.viseme.map(AssetKey::Viseme))
                .unwrap_or(expression),
            DeliveryTier::Visemes => self.viseme.map(AssetKey::Viseme).unwrap_or(expression),
            DeliveryTier::Expressions => expression,
            DeliveryTier::StaticNeutral => AssetKey::Expression(Expression::Neutral),
        }
    }
}

/// The backend that serves a key, independent of the tier that asked.
pub fn backend_for(key: AssetKey) -> Backend {
    match key {
        AssetKey::Frame(_) => Backend::FullFrames,
        AssetKey::Viseme(_) => Backend::Visemes,
        AssetKey::Expression(_) => Backend::Expressions,
    }
}

/// The tier whose backend serves a key.
pub fn tier_for(key: AssetKey) -> DeliveryTier {
    match key {
        AssetKey::Frame(_) => DeliveryTier::FullFrames,
        AssetKey::Viseme(_) => DeliveryTier::Visemes,
        AssetKey::Expression(_) => DeliveryTier::Expressions,
    }
}

/// Where a lookup will be served from. `tier` is the tier that actually
/// serves `key`, which may be coarser than the tier that was asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub tier: DeliveryTier,
    pub key: AssetKey,
    pub url: String,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resilient avatar asset delivery.
pub struct DeliveryPolicy<F> {
    config: Arc<CdnConfig>,
    locator: AssetLocator,
    cache: FrameCache,
    breaker: SharedBreaker,
    fetcher: Arc<F>,
    tier: Arc<Mutex<DeliveryTier>>,
    missing: Arc<Mutex<HashSet<String>>>,
}

impl<F> Clone for DeliveryPolicy<F> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            locator: self.locator.clone(),
            cache: self.cache.clone(),
            breaker: self.breaker.clone(),
            fetcher: Arc::clone(&self.fetcher),
            tier: Arc::clone(&self.tier),
            missing: Arc::clone(&self.missing),
        }
    }
}

impl<F> std::fmt::Debug for DeliveryPolicy<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPolicy")
            .field("tier", &*lock(&self.tier))
            .field("cache", &self.cache)
            .finish()
    }
}

impl<F: AssetFetcher + 'static> DeliveryPolicy<F> {
    /// Build a policy. `breaker` is shared with every other component that
    /// guards a backend, e.g. the synthesis client.
    pub fn new(config: Arc<CdnConfig>, fetcher: F, breaker: SharedBreaker) -> Self {
        Self {
            locator: AssetLocator::new(Arc::clone(&config)),
            cache: FrameCache::new(config.cache_capacity),
            tier: Arc::new(Mutex::new(config.initial_tier)),
            config,
            breaker,
            fetcher: Arc::new(fetcher),
            missing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn locator(&self) -> &AssetLocator {
        &self.locator
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    pub fn breaker(&self) -> &SharedBreaker {
        &self.breaker
    }

    /// Player-wide delivery tier.
    pub fn tier(&self) -> DeliveryTier {
        *lock(&self.tier)
    }

    pub fn circuits(&self) -> Vec<CircuitReport> {
        self.breaker.health_report()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Operator reset: close every circuit, forget known misses and return
    /// to the configured initial tier. Cached frames are kept.
    pub fn reset(&self) {
        self.breaker.reset();
        lock(&self.missing).clear();
        *lock(&self.tier) = self.config.initial_tier;
        info!(tier = %self.config.initial_tier, "delivery policy reset");
    }

    /// Start a per-utterance lookup session.
    pub fn session(&self, cancel: CancellationToken) -> DeliverySession<F> {
        DeliverySession {
            policy: self.clone(),
            cancel,
            last: None,
        }
    }

    /// Degrade the player-wide tier one step, but only if it is still `from`.
    fn degrade_from(&self, from: DeliveryTier) {
        let mut tier = lock(&self.tier);
        if *tier == from {
            if let Some(next) = from.degraded() {
                warn!(from = %from, to = %next, "delivery tier degraded");
                *tier = next;
            }
        }
    }

    fn is_missing(&self, url: &str) -> bool {
        lock(&self.missing).contains(url)
    }

    fn static_handle(&self, avatar: AvatarId) -> AssetHandle {
        AssetHandle::loaded(
            self.locator.static_neutral_url(avatar),
            DeliveryTier::StaticNeutral,
            bytes::Bytes::new(),
        )
    }

    /// Where `request` lands when asked at `tier`.
    pub fn placement_at(&self, request: &AssetRequest, tier: DeliveryTier) -> Placement {
        let key = self
            .locator
            .downgrade(request.avatar, request.key_for(tier), tier);
        let served = if tier == DeliveryTier::StaticNeutral {
            tier
        } else {
            tier_for(key)
        };
        Placement {
            tier: served,
            key,
            url: self.locator.resolve(request.avatar, key, served),
        }
    }

    /// A lookup asked at `asked` could not be served by `failed`'s backend.
    ///
    /// The tier degrades when that backend is the one its lookups land on.
    /// Expression-only lookups say nothing about the finer tiers.
    fn degrade_after(&self, asked: DeliveryTier, failed: &Placement) {
        if failed.tier == asked || failed.tier != DeliveryTier::Expressions {
            self.degrade_from(asked);
        }
    }

    /// Pick where `request` would be served right now without any I/O.
    ///
    /// Tiers whose backend circuit is blocking are skipped and may degrade
    /// the player-wide tier. URLs known to be missing are skipped without
    /// degrading.
    pub fn place(&self, request: &AssetRequest) -> Placement {
        let mut tier = self.tier();
        loop {
            let placement = self.placement_at(request, tier);
            if tier == DeliveryTier::StaticNeutral {
                return placement;
            }
            let backend = backend_for(placement.key);
            if self.breaker.is_blocking(backend) {
                self.degrade_after(tier, &placement);
                debug!(%backend, tier = %tier, "circuit blocking, trying next tier");
            } else if !self.is_missing(&placement.url) {
                return placement;
            }
            tier = tier.degraded().unwrap_or(DeliveryTier::StaticNeutral);
        }
    }

    /// Fetch `url` through retry and the circuit breaker, building a loaded
    /// handle on success.
    fn fetch_guarded(
        &self,
        backend: Backend,
        tier: DeliveryTier,
        url: String,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<AssetHandle>> + Send + 'static {
        let fetcher = Arc::clone(&self.fetcher);
        let breaker = self.breaker.clone();
        let retry = self.config.retry.clone();
        async move {
            let bytes = retry_guarded(backend, &retry, &breaker, &cancel, |_| {
                let fetcher = Arc::clone(&fetcher);
                let url = url.clone();
                async move { fetcher.fetch(&url).await }
            })
            .await?;
            Ok(AssetHandle::loaded(url, tier, bytes))
        }
    }

    /// Resolve `request` to a loaded handle, walking down the tiers as
    /// needed. Waits for the network; ticks use [`DeliverySession`].
    ///
    /// Only fails when cancelled: the static-neutral tier always resolves.
    pub async fn resolve(
        &self,
        request: &AssetRequest,
        cancel: &CancellationToken,
    ) -> Result<AssetHandle> {
        let mut tier = self.tier();
        let mut unavailable: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }
            if tier == DeliveryTier::StaticNeutral {
                return Ok(self.static_handle(request.avatar));
            }
            let placement = self.placement_at(request, tier);
            let url = &placement.url;

            if unavailable.as_ref() == Some(url) {
                // Same asset as the tier above: same outcome, no second fetch.
                self.degrade_after(tier, &placement);
            } else if !self.is_missing(url) {
                let backend = backend_for(placement.key);
                let fetch =
                    || self.fetch_guarded(backend, placement.tier, url.clone(), cancel.clone());
                match self.cache.get_or_fetch(url, cancel, fetch).await {
                    Ok(handle) => return Ok(handle),
                    Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
                    Err(DeliveryError::NotFound(reason)) => {
                        debug!(url = %url, reason = %reason, "asset missing, falling through");
                        lock(&self.missing).insert(url.clone());
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "asset unavailable");
                        self.degrade_after(tier, &placement);
                        unavailable = Some(url.clone());
                    }
                }
            }
            tier = tier.degraded().unwrap_or(DeliveryTier::StaticNeutral);
        }
    }

    /// Start resolving `request` in the background unless it is already
    /// cached or being fetched. Returns whether a task was started.
    pub fn prefetch(&self, request: AssetRequest, cancel: &CancellationToken) -> bool {
        let placement = self.place(&request);
        if placement.tier == DeliveryTier::StaticNeutral
            || self.cache.contains(&placement.url)
            || self.cache.is_in_flight(&placement.url)
        {
            return false;
        }
        let policy = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = policy.resolve(&request, &cancel).await {
                debug!(error = %e, "background resolve ended");
            }
        });
        true
    }

    /// Prefetch a batch of upcoming requests. Never waits.
    pub fn preload<I>(&self, requests: I, cancel: &CancellationToken) -> usize
    where
        I: IntoIterator<Item = AssetRequest>,
    {
        requests
            .into_iter()
            .take(self.config.preload_ahead as usize)
            .filter(|r| self.prefetch(*r, cancel))
            .count()
    }

    /// Fetch the given expressions for `avatar` and wait for all of them.
    /// Returns how many resolved at a remote tier.
    pub async fn warm_up(
        &self,
        avatar: AvatarId,
        expressions: &[Expression],
        cancel: &CancellationToken,
    ) -> usize {
        let requests: Vec<AssetRequest> = expressions
            .iter()
            .map(|e| AssetRequest::expression(avatar, *e))
            .collect();
        let results = join_all(requests.iter().map(|r| self.resolve(r, cancel))).await;
        let loaded = results
            .iter()
            .filter(|r| {
                r.as_ref()
                    .is_ok_and(|h| h.tier != DeliveryTier::StaticNeutral)
            })
            .count();
        info!(%avatar, loaded, requested = expressions.len(), "critical assets warmed");
        loaded
    }

    /// Fetch one absolute URL into the cache, e.g. from the asset manifest.
    pub async fn prefetch_url(
        &self,
        url: &str,
        backend: Backend,
        tier: DeliveryTier,
        cancel: &CancellationToken,
    ) -> Result<AssetHandle> {
        let fetch = || self.fetch_guarded(backend, tier, url.to_owned(), cancel.clone());
        self.cache.get_or_fetch(url, cancel, fetch).await
    }

    /// Probe the CDN once and promote the tier one step on success.
    ///
    /// Returns the new tier if it changed.
    pub async fn probe_and_promote(&self) -> Option<DeliveryTier> {
        let current = self.tier();
        let target = current.promoted()?;
        match self.fetcher.probe(&self.locator.health_url()).await {
            Ok(()) => {
                if let Some(backend) = target.backend() {
                    self.breaker.record_success(backend);
                }
                let mut tier = lock(&self.tier);
                if *tier != current {
                    return None;
                }
                *tier = target;
                info!(from = %current, to = %target, "delivery tier promoted");
                Some(target)
            }
            Err(e) => {
                debug!(error = %e, tier = %current, "health probe failed");
                None
            }
        }
    }

    /// Run [`Self::probe_and_promote`] on the configured interval until
    /// `cancel` fires. Returns `None` when probing is disabled.
    pub fn spawn_health_probe(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.config.health_probe_interval_secs == 0 {
            return None;
        }
        let interval = Duration::from_secs(self.config.health_probe_interval_secs);
        let policy = self.clone();
        Some(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "delivery health probe started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("delivery health probe stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if policy.tier() != DeliveryTier::FullFrames {
                            policy.probe_and_promote().await;
                        }
                    }
                }
            }
        }))
    }
}

/// Lookup state for one utterance.
///
/// Remembers the last frame it served so a cache miss can repeat it
/// instead of blanking the avatar.
pub struct DeliverySession<F> {
    policy: DeliveryPolicy<F>,
    cancel: CancellationToken,
    last: Option<AssetHandle>,
}

impl<F: AssetFetcher + 'static> DeliverySession<F> {
    /// The handle to paint for `request` this tick. Never waits.
    pub fn frame_for(&mut self, request: &AssetRequest) -> AssetHandle {
        let placement = self.policy.place(request);
        if placement.tier == DeliveryTier::StaticNeutral {
            let handle = self.policy.static_handle(request.avatar);
            self.last = Some(handle.clone());
            return handle;
        }
        if let Some(hit) = self.policy.cache.get(&placement.url) {
            self.last = Some(hit.clone());
            return hit;
        }
        self.policy.prefetch(*request, &self.cancel);
        match &self.last {
            Some(last) => last.clone(),
            None => AssetHandle::pending(placement.url, placement.tier),
        }
    }

    /// Prefetch upcoming requests for this session.
    pub fn preload<I>(&self, requests: I) -> usize
    where
        I: IntoIterator<Item = AssetRequest>,
    {
        self.policy.preload(requests, &self.cancel)
    }

    pub fn last_resolved(&self) -> Option<&AssetHandle> {
        self.last.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
