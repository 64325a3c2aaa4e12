//! Audio playback: decoding, the analyser graph, the unlock gate and the
//! playback binder whose clock drives the frame scheduler.

pub mod analyser;
pub mod decode;
pub mod graph;
pub mod playback;
pub mod unlock;

pub use analyser::Analyser;
pub use decode::{DecodedAudio, decode_base64_wav, decode_wav, encode_wav, write_wav};
pub use graph::{AudioDestination, AudioGraph, NullDestination, WavFileDestination};
pub use playback::{AudioClock, Playback, PlaybackBinder, PlaybackClock};
pub use unlock::UnlockGate;
