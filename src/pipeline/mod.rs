//! Lesson playback pipeline.

pub mod coordinator;
pub mod messages;

pub use coordinator::LessonPlayer;
pub use messages::{PlayerStatus, SpeakOutcome, WarmUpReport};
