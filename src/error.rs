//! Error types for the lesson player.

use avatar_cdn::DeliveryError;

/// Top-level error type for the lesson player.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// The speech-synthesis service could not produce audio.
    #[error("synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    /// The line was rejected by the pre-flight filter.
    #[error("blocked text: {0}")]
    Blocked(String),

    /// Audio graph or playback error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Malformed audio or synthesis payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// Playback was superseded by a newer utterance or stopped.
    #[error("playback interrupted")]
    Interrupted,

    /// Playback is waiting for the user-gesture unlock.
    #[error("playback blocked until unlock")]
    PlaybackBlocked,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Avatar delivery error.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PlayerError>;
