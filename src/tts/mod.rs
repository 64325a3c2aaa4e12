//! Text-to-speech through the remote synthesis service.
//!
//! The service turns a line of lesson text into a WAV clip plus phoneme
//! timings for one of the avatar voices. This module holds the client,
//! its result cache, the pre-flight text filter and lesson batch rendering.

pub mod cache;
pub mod lesson;
pub mod preflight;
pub mod remote;

pub use cache::{SynthesisCache, SynthesisKey};
pub use lesson::{Lesson, LessonAudio, synthesize_lesson};
pub use preflight::PreflightFilter;
pub use remote::RemoteSynthesizer;

use std::sync::Arc;

use async_trait::async_trait;
use avatar_cdn::AvatarId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::audio::DecodedAudio;
use crate::error::Result;
use crate::viseme::PhonemeTiming;

/// One synthesized line.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub text: String,
    pub speaker: AvatarId,
    pub audio: DecodedAudio,
    /// Reported duration in seconds.
    pub duration_secs: f64,
    /// Phoneme timings in seconds; empty when the service sent none.
    pub phonemes: Vec<PhonemeTiming>,
    /// Engine name reported by the service.
    pub engine: Option<String>,
}

impl Synthesis {
    /// Duration in milliseconds, preferring the decoded audio length.
    pub fn duration_ms(&self) -> u64 {
        let decoded = self.audio.duration_ms();
        if decoded > 0 {
            decoded
        } else {
            (self.duration_secs.max(0.0) * 1000.0).round() as u64
        }
    }
}

/// Liveness report of the synthesis service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisHealth {
    pub status: String,
    pub server: Option<String>,
    pub version: Option<String>,
    pub engine: Option<String>,
    pub message: Option<String>,
    pub timestamp: Option<String>,
    pub voices: Vec<String>,
}

impl SynthesisHealth {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy") || self.status.eq_ignore_ascii_case("ok")
    }

    /// Whether the service reports a voice for `speaker`.
    pub fn has_voice(&self, speaker: AvatarId) -> bool {
        self.voices
            .iter()
            .any(|v| v.eq_ignore_ascii_case(speaker.as_str()))
    }
}

/// Something that can voice lesson text.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` in `speaker`'s voice.
    async fn synthesize(
        &self,
        text: &str,
        speaker: AvatarId,
        cancel: &CancellationToken,
    ) -> Result<Arc<Synthesis>>;

    /// Query service liveness.
    async fn health(&self) -> Result<SynthesisHealth>;
}
