//! Offline asset manifest.
//!
//! The deployment tooling writes `asset-manifest.json` next to the bundled
//! assets:
//!
//! ```json
//! {
//!   "version": "1.0.0",
//!   "cdnBase": "https://cdn.ilearnhow.com/avatars",
//!   "assets": {
//!     "kelly/base-states/kelly_neutral_default.png": {
//!       "path": "kelly/base-states/kelly_neutral_default.png",
//!       "url": "https://cdn.ilearnhow.com/avatars/kelly/base-states/kelly_neutral_default.png",
//!       "size": 48213, "hash": "9f2c…", "avatar": "kelly",
//!       "category": "base-states", "cache": "1y", "preload": true
//!     }
//!   },
//!   "preloadList": ["kelly/base-states/kelly_neutral_default.png"]
//! }
//! ```
//!
//! The player only reads it, to warm the frame cache with the assets marked
//! `preload`.

use std::collections::BTreeMap;
use std::path::Path;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, Result};
use crate::http::AssetFetcher;
use crate::policy::DeliveryPolicy;
use crate::types::{AvatarId, Backend, DeliveryTier};

/// One asset listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the asset root, e.g. `ken/visemes_flat/A.png`.
    pub path: String,
    /// Absolute CDN URL.
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub hash: String,
    pub avatar: AvatarId,
    #[serde(default)]
    pub category: String,
    /// Cache lifetime hint, e.g. `1y` or `30d`.
    #[serde(default)]
    pub cache: String,
    #[serde(default)]
    pub preload: bool,
}

impl ManifestEntry {
    /// Backend and tier this entry's category is served by.
    pub fn placement(&self) -> (Backend, DeliveryTier) {
        match self.category.as_str() {
            "frames" => (Backend::FullFrames, DeliveryTier::FullFrames),
            "visemes" | "phonemes" => (Backend::Visemes, DeliveryTier::Visemes),
            _ => (Backend::Expressions, DeliveryTier::Expressions),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub files: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManifestStatistics {
    pub total_files: u64,
    pub total_size: u64,
    pub by_avatar: BTreeMap<String, FileStats>,
    pub by_category: BTreeMap<String, FileStats>,
}

/// The parsed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssetManifest {
    pub version: Option<String>,
    pub generated: Option<String>,
    pub cdn_base: Option<String>,
    pub assets: BTreeMap<String, ManifestEntry>,
    pub preload_list: Vec<String>,
    pub statistics: ManifestStatistics,
}

impl AssetManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| DeliveryError::Parse(format!("invalid manifest: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            DeliveryError::Config(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Entries flagged for preloading.
    ///
    /// Follows `preloadList` order when present; otherwise every entry with
    /// `preload: true`, ordered by path. Unknown paths in the list are
    /// skipped.
    pub fn preload_entries(&self) -> Vec<&ManifestEntry> {
        if self.preload_list.is_empty() {
            self.assets.values().filter(|e| e.preload).collect()
        } else {
            self.preload_list
                .iter()
                .filter_map(|p| self.assets.get(p))
                .collect()
        }
    }

    pub fn preload_entries_for(&self, avatar: AvatarId) -> Vec<&ManifestEntry> {
        self.preload_entries()
            .into_iter()
            .filter(|e| e.avatar == avatar)
            .collect()
    }
}

/// Fetch every preload entry for `avatar` into the policy's frame cache.
/// Returns how many were loaded. Failures are logged and skipped.
pub async fn warm_from_manifest<F: AssetFetcher + 'static>(
    policy: &DeliveryPolicy<F>,
    manifest: &AssetManifest,
    avatar: AvatarId,
    cancel: &CancellationToken,
) -> usize {
    let entries = manifest.preload_entries_for(avatar);
    let fetches = entries.iter().map(|entry| {
        let (backend, tier) = entry.placement();
        policy.prefetch_url(&entry.url, backend, tier, cancel)
    });
    let results = join_all(fetches).await;
    let mut loaded = 0;
    for (entry, result) in entries.iter().zip(results) {
        match result {
            Ok(_) => loaded += 1,
            Err(e) => tracing::warn!(path = %entry.path, error = %e, "manifest preload failed"),
        }
    }
    tracing::info!(%avatar, loaded, listed = entries.len(), "manifest assets warmed");
    loaded
}
