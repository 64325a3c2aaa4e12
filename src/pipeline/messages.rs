//! Values the player hands back to its host.

use avatar_cdn::{Backend, CacheStats, CircuitReport, CircuitState, DeliveryTier};
use serde::Serialize;

use crate::config::FrameStrategy;
use crate::scheduler::SessionState;

/// How a `speak` call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SpeakOutcome {
    /// The line played to its end.
    Completed {
        session: u64,
        duration_ms: u64,
        strategy: FrameStrategy,
    },
    /// The pre-flight filter refused the line. Nothing was requested.
    Blocked { reason: String },
    /// Stopped, or superseded by a newer line.
    Interrupted,
}

impl SpeakOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Snapshot for the UI.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerStatus {
    pub tier: DeliveryTier,
    pub circuits: Vec<CircuitReport>,
    pub cache: CacheStats,
    pub session: SessionState,
    /// Id of the newest scheduler session.
    pub generation: u64,
    pub playing: bool,
    /// Playback is waiting for the user-gesture unlock.
    pub playback_blocked: bool,
    /// RMS level of the audio currently playing.
    pub level: f32,
}

impl PlayerStatus {
    /// Whether the host should fall back to showing text only: the avatar
    /// is down to its static image or speech synthesis is failing.
    pub fn text_only_recommended(&self) -> bool {
        self.tier == DeliveryTier::StaticNeutral
            || self
                .circuits
                .iter()
                .any(|c| c.backend == Backend::Synthesis && c.state == CircuitState::Open)
    }
}

/// What a warm-up pass loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmUpReport {
    pub expressions: usize,
    pub manifest: usize,
}
