//! Utterance playback and the audio clock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::decode::DecodedAudio;
use crate::audio::graph::AudioGraph;
use crate::audio::unlock::UnlockGate;
use crate::config::AudioConfig;
use crate::error::{PlayerError, Result};

/// Time source the frame scheduler follows.
pub trait PlaybackClock: Send + Sync {
    /// Position of the audible playback within the current utterance.
    fn current_time_ms(&self) -> u64;

    /// Whether the current utterance has played to its end.
    fn is_finished(&self) -> bool;
}

#[derive(Debug, Default)]
struct ClockState {
    utterance: AtomicU64,
    position_ms: AtomicU64,
    finished: AtomicBool,
}

/// The binder's clock. Cloning shares the same position.
#[derive(Debug, Clone, Default)]
pub struct AudioClock {
    state: Arc<ClockState>,
}

impl AudioClock {
    fn restart(&self, utterance: u64) {
        self.state.utterance.store(utterance, Ordering::SeqCst);
        self.state.position_ms.store(0, Ordering::SeqCst);
        self.state.finished.store(false, Ordering::SeqCst);
    }

    fn advance_to(&self, position_ms: u64) {
        self.state.position_ms.store(position_ms, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.state.finished.store(true, Ordering::SeqCst);
    }

    /// Id of the utterance the clock is currently measuring.
    pub fn utterance(&self) -> u64 {
        self.state.utterance.load(Ordering::SeqCst)
    }
}

impl PlaybackClock for AudioClock {
    fn current_time_ms(&self) -> u64 {
        self.state.position_ms.load(Ordering::SeqCst)
    }

    fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Current {
    id: u64,
    cancel: CancellationToken,
}

/// Owns the audio graph and plays one utterance at a time through it.
///
/// Starting an utterance supersedes the previous one: its playback returns
/// [`PlayerError::Interrupted`] at its next render quantum without holding
/// up the new one.
#[derive(Debug)]
pub struct PlaybackBinder {
    graph: Arc<Mutex<AudioGraph>>,
    gate: UnlockGate,
    clock: AudioClock,
    current: Arc<Mutex<Option<Current>>>,
    next_id: AtomicU64,
    quantum_frames: usize,
    realtime: bool,
}

impl PlaybackBinder {
    pub fn new(graph: AudioGraph, gate: UnlockGate, config: &AudioConfig) -> Self {
        Self {
            graph: Arc::new(Mutex::new(graph)),
            gate,
            clock: AudioClock::default(),
            current: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            quantum_frames: config.quantum_frames.max(1),
            realtime: config.realtime,
        }
    }

    /// Binder over a headless graph, as configured.
    pub fn headless(config: &AudioConfig) -> Self {
        Self::new(
            AudioGraph::headless(config.fft_size),
            UnlockGate::new(config.require_unlock),
            config,
        )
    }

    pub fn gate(&self) -> &UnlockGate {
        &self.gate
    }

    pub fn clock(&self) -> AudioClock {
        self.clock.clone()
    }

    /// The scheduler's clock source.
    pub fn current_time_ms(&self) -> u64 {
        self.clock.current_time_ms()
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.current).is_some()
    }

    /// RMS level of what is currently playing.
    pub fn level(&self) -> f32 {
        lock(&self.graph).analyser().rms()
    }

    /// Magnitude spectrum of what is currently playing.
    pub fn spectrum(&self) -> Vec<f32> {
        lock(&self.graph).analyser().spectrum()
    }

    /// Supersede whatever is playing and make `audio` current.
    ///
    /// The clock restarts at zero before this returns, so a scheduler armed
    /// afterwards never sees the previous utterance's position.
    pub fn begin(&self, audio: DecodedAudio) -> Playback {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        if let Some(prev) = lock(&self.current).replace(Current {
            id,
            cancel: cancel.clone(),
        }) {
            debug!(utterance = prev.id, "superseding playback");
            prev.cancel.cancel();
        }
        {
            let _graph = lock(&self.graph);
            self.clock.restart(id);
        }
        Playback {
            id,
            audio,
            cancel,
            graph: Arc::clone(&self.graph),
            gate: self.gate.clone(),
            clock: self.clock.clone(),
            current: Arc::clone(&self.current),
            quantum_frames: self.quantum_frames,
            realtime: self.realtime,
        }
    }

    /// Play `audio` to the end.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Interrupted`] when superseded or stopped, or
    /// the destination's error if rendering fails.
    pub async fn play_utterance(&self, audio: DecodedAudio) -> Result<()> {
        self.begin(audio).run().await
    }

    /// Stop the current utterance, if any.
    pub fn stop(&self) {
        if let Some(current) = lock(&self.current).take() {
            info!(utterance = current.id, "playback stopped");
            current.cancel.cancel();
        }
    }
}

/// One utterance, made current by [`PlaybackBinder::begin`].
#[derive(Debug)]
pub struct Playback {
    id: u64,
    audio: DecodedAudio,
    cancel: CancellationToken,
    graph: Arc<Mutex<AudioGraph>>,
    gate: UnlockGate,
    clock: AudioClock,
    current: Arc<Mutex<Option<Current>>>,
    quantum_frames: usize,
    realtime: bool,
}

impl Playback {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn clock(&self) -> AudioClock {
        self.clock.clone()
    }

    pub fn duration_ms(&self) -> u64 {
        self.audio.duration_ms()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Render the utterance, paced in real time unless configured otherwise.
    ///
    /// # Errors
    ///
    /// See [`PlaybackBinder::play_utterance`].
    pub async fn run(self) -> Result<()> {
        if !self.gate.is_unlocked() {
            info!(utterance = self.id, "playback waiting for unlock");
        }
        let result = match self.gate.wait(&self.cancel).await {
            Ok(()) => self.render().await,
            Err(e) => Err(e),
        };
        {
            let mut current = lock(&self.current);
            if current.as_ref().is_some_and(|c| c.id == self.id) {
                *current = None;
            }
        }
        result
    }

    async fn render(&self) -> Result<()> {
        let rate = u64::from(self.audio.sample_rate.max(1));
        let samples = &self.audio.samples;
        let started = Instant::now();
        let mut pos = 0usize;
        debug!(
            utterance = self.id,
            duration_ms = self.audio.duration_ms(),
            "playback started"
        );

        loop {
            {
                let mut graph = lock(&self.graph);
                if self.cancel.is_cancelled() {
                    return Err(PlayerError::Interrupted);
                }
                self.clock.advance_to(pos as u64 * 1000 / rate);
                if pos >= samples.len() {
                    graph.end_utterance()?;
                    self.clock.finish();
                    break;
                }
                let end = (pos + self.quantum_frames).min(samples.len());
                graph.render(&samples[pos..end], self.audio.sample_rate)?;
                pos = end;
            }

            if self.realtime {
                let due = started + Duration::from_micros(pos as u64 * 1_000_000 / rate);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(PlayerError::Interrupted),
                    _ = tokio::time::sleep_until(due) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        debug!(utterance = self.id, "playback finished");
        Ok(())
    }
}
