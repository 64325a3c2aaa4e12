//! Frame scheduling.
//!
//! Turns the playback clock and the utterance's timing track into one
//! [`RenderFrame`] per tick:
//!
//! - [`selection`]: which viseme or frame belongs to an instant
//! - [`rate`]: tick rate that backs off under load
//! - [`session`]: the per-utterance state machine and tick loop

pub mod rate;
pub mod selection;
pub mod session;

pub use rate::AdaptiveFrameRate;
pub use selection::{FrameSelection, FrameSelector, entry_index_at, time_frame};
pub use session::{FrameScheduler, RenderFrame, SessionHandle, SessionState, Utterance};
