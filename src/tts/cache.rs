//! Synthesis result cache.
//!
//! Lines repeat a lot across a lesson (answers, prompts, replays), so each
//! synthesized line is kept for a while keyed by `(speaker, text)`. Backed
//! by [`moka`] for TTL expiry and bounded size.

use std::sync::Arc;
use std::time::Duration;

use avatar_cdn::AvatarId;
use moka::future::Cache;

use crate::config::CacheConfig;
use crate::tts::Synthesis;

/// Cache key: voice plus the exact line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SynthesisKey {
    speaker: AvatarId,
    text: String,
}

impl SynthesisKey {
    pub fn new(speaker: AvatarId, text: &str) -> Self {
        Self {
            speaker,
            text: text.trim().to_owned(),
        }
    }
}

/// Bounded TTL cache of synthesized lines.
#[derive(Clone)]
pub struct SynthesisCache {
    inner: Cache<SynthesisKey, Arc<Synthesis>>,
}

impl std::fmt::Debug for SynthesisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl SynthesisCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(Duration::from_secs(config.ttl_secs))
                .build(),
        }
    }

    pub async fn get(&self, key: &SynthesisKey) -> Option<Arc<Synthesis>> {
        self.inner.get(key).await
    }

    pub async fn insert(&self, key: SynthesisKey, synthesis: Arc<Synthesis>) {
        self.inner.insert(key, synthesis).await;
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }
}
