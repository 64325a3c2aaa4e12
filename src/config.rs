//! Configuration types for the lesson player.

use std::collections::BTreeMap;
use std::path::PathBuf;

use avatar_cdn::{AvatarId, CdnConfig, Expression, RetryPolicy, Viseme};
use serde::{Deserialize, Serialize};

use crate::error::{PlayerError, Result};

/// Top-level configuration for the lesson player.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Avatar presenting lessons.
    pub avatar: AvatarId,
    /// Remote speech-synthesis service.
    pub synthesis: SynthesisConfig,
    /// Avatar CDN layout, frame cache, retry and circuit breaker.
    pub cdn: CdnConfig,
    /// Start-up warm-up of critical assets.
    pub delivery: DeliveryConfig,
    /// Frame scheduling.
    pub scheduler: SchedulerConfig,
    /// Synthesis result cache.
    pub cache: CacheConfig,
    /// Audio graph settings.
    pub audio: AudioConfig,
    /// Phoneme-to-viseme tables.
    pub lipsync: LipSyncConfig,
    /// Pre-flight text filter.
    pub preflight: PreflightConfig,
}

/// Speech-synthesis service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Base URL; requests go to `{base_url}/api/tts` and `{base_url}/health`.
    pub base_url: String,
    /// Ask the service for phoneme timings.
    pub include_phonemes: bool,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Retry policy for synthesis calls.
    pub retry: RetryPolicy,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5002".to_owned(),
            include_phonemes: true,
            timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

/// Critical-asset warm-up configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Expressions fetched for the active avatar at start-up.
    pub warm_up_expressions: Vec<Expression>,
    /// Optional `asset-manifest.json` whose preload entries are fetched too.
    pub manifest_path: Option<PathBuf>,
    /// Run the background CDN health probe.
    pub health_probe: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            warm_up_expressions: vec![
                Expression::Neutral,
                Expression::TeachingExplaining,
                Expression::QuestionCurious,
            ],
            manifest_path: None,
            health_probe: true,
        }
    }
}

/// How the scheduler picks a frame for the current playback time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStrategy {
    /// Follow the phoneme timing track; falls back to `Time` without one.
    #[default]
    Phoneme,
    /// Map playback progress linearly onto the frame sequence.
    Time,
}

/// Frame scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub strategy: FrameStrategy,
    /// Frame rate floor under sustained slow ticks.
    pub min_fps: u32,
    /// Frame rate the scheduler aims for.
    pub target_fps: u32,
    /// Ceiling for upward adaptation.
    pub max_fps: u32,
    /// Ticks slower than this multiple of the frame interval count as slow.
    pub slow_tick_factor: f32,
    /// Render-frame channel capacity.
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: FrameStrategy::Phoneme,
            min_fps: 24,
            target_fps: 30,
            max_fps: 60,
            slow_tick_factor: 1.5,
            channel_capacity: 64,
        }
    }
}

/// Synthesis result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum cached utterances.
    pub capacity: u64,
    /// Seconds before a cached utterance expires.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 200,
            ttl_secs: 3600,
        }
    }
}

/// Audio graph configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Wait for an explicit unlock before the first playback.
    pub require_unlock: bool,
    /// FFT size of the analyser (power of two).
    pub fft_size: usize,
    /// Samples pushed to the destination per render quantum.
    pub quantum_frames: usize,
    /// Pace rendering in real time. Off renders as fast as the destination
    /// accepts samples.
    pub realtime: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            require_unlock: false,
            fft_size: 1024,
            quantum_frames: 480,
            realtime: true,
        }
    }
}

/// Lip-sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LipSyncConfig {
    /// Language used when a lesson does not name one.
    pub default_language: String,
    /// Extra or overriding tables: language → token → viseme.
    pub tables: BTreeMap<String, BTreeMap<String, Viseme>>,
}

impl Default for LipSyncConfig {
    fn default() -> Self {
        Self {
            default_language: "en".to_owned(),
            tables: BTreeMap::new(),
        }
    }
}

/// Pre-flight filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    pub enabled: bool,
    /// Whole-line placeholder phrases (compared case-insensitively).
    pub blocked_phrases: Vec<String>,
    /// Markers that block a line wherever they appear.
    pub blocked_markers: Vec<String>,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_phrases: [
                "lesson orientation",
                "vitamin cue",
                "timing habit",
                "cloudy/indoor fixes",
                "close + plan",
                "script_text",
                "placeholder",
                "test audio",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            blocked_markers: vec!["placeholder".to_owned(), "script_text".to_owned()],
        }
    }
}

impl PlayerConfig {
    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.cdn
            .validate()
            .map_err(|e| PlayerError::Config(e.to_string()))?;
        url::Url::parse(&self.synthesis.base_url).map_err(|e| {
            PlayerError::Config(format!("synthesis.base_url is not a URL: {e}"))
        })?;
        if self.synthesis.timeout_secs == 0 {
            return Err(PlayerError::Config(
                "synthesis.timeout_secs must be greater than 0".into(),
            ));
        }
        let s = &self.scheduler;
        if s.min_fps == 0 || s.min_fps > s.target_fps || s.target_fps > s.max_fps {
            return Err(PlayerError::Config(format!(
                "scheduler fps must satisfy 0 < min ({}) <= target ({}) <= max ({})",
                s.min_fps, s.target_fps, s.max_fps
            )));
        }
        if s.channel_capacity == 0 {
            return Err(PlayerError::Config(
                "scheduler.channel_capacity must be greater than 0".into(),
            ));
        }
        if !self.audio.fft_size.is_power_of_two() || self.audio.fft_size < 32 {
            return Err(PlayerError::Config(format!(
                "audio.fft_size must be a power of two >= 32, got {}",
                self.audio.fft_size
            )));
        }
        if self.audio.quantum_frames == 0 {
            return Err(PlayerError::Config(
                "audio.quantum_frames must be greater than 0".into(),
            ));
        }
        if self.lipsync.default_language.trim().is_empty() {
            return Err(PlayerError::Config(
                "lipsync.default_language must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| PlayerError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| PlayerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/lesson-avatar/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("lesson-avatar").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("lesson-avatar")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/lesson-avatar/config.toml")
        }
    }
}
