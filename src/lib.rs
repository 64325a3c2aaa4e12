//! lesson-avatar: a talking-avatar lesson player.
//!
//! Lesson text is voiced by a remote speech-synthesis service while an
//! avatar lip-syncs to it, frame by frame, from images on a CDN:
//! Text → pre-flight → Synthesis → Viseme track → Playback + Frame scheduler → Renderer
//!
//! # Architecture
//!
//! - **TTS**: client for the synthesis service with a result cache and a
//!   placeholder filter in front of it
//! - **Viseme**: phoneme-to-viseme mapping and the per-utterance timing track
//! - **Audio**: WAV decoding, the playback graph and its clock, the unlock gate
//! - **Scheduler**: ticks against the audio clock and picks the frame to show
//! - **Delivery**: the `avatar-cdn` crate resolves frames with tier fallback
//! - **Pipeline**: [`LessonPlayer`] wires the stages together

pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod scheduler;
pub mod tts;
pub mod viseme;

pub use config::PlayerConfig;
pub use error::{PlayerError, Result};
pub use pipeline::{LessonPlayer, PlayerStatus, SpeakOutcome, WarmUpReport};
pub use scheduler::{RenderFrame, SessionState};
