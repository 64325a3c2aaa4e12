//! Scheduler sessions and the tick loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use avatar_cdn::{AssetFetcher, AssetHandle, AvatarId, DeliveryPolicy, Expression};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::PlaybackClock;
use crate::config::SchedulerConfig;
use crate::error::{PlayerError, Result};
use crate::scheduler::rate::AdaptiveFrameRate;
use crate::scheduler::selection::{FrameSelection, FrameSelector};
use crate::viseme::SpeechTimingTrack;

/// Lifecycle of one scheduler session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Armed,
    Running,
    Completed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// What a session animates.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub avatar: AvatarId,
    pub track: Option<Arc<SpeechTimingTrack>>,
    pub duration_ms: u64,
    pub expression: Expression,
}

/// One tick's output, sent to the renderer.
#[derive(Debug, Clone)]
pub struct RenderFrame {
    pub session: u64,
    pub time_ms: u64,
    pub selection: FrameSelection,
    /// Image to paint; may be a pending placeholder.
    pub handle: AssetHandle,
    /// Tick rate in effect.
    pub fps: u32,
}

/// Handle to an armed or running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
    utterance: Arc<Utterance>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the session. Has no effect once it has completed.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.transition(SessionState::Cancelled);
    }

    /// Wait until the session completes or is cancelled.
    pub async fn finished(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Move to `next` unless the session already ended.
    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives per-tick frame selection from the playback clock.
///
/// Only one session is live at a time. Arming a session cancels the
/// previous one, and a frame is only sent while its session is still the
/// newest, checked under the same lock as the send.
pub struct FrameScheduler<F> {
    config: SchedulerConfig,
    policy: DeliveryPolicy<F>,
    generation: Arc<AtomicU64>,
    sink: Arc<Mutex<mpsc::Sender<RenderFrame>>>,
    active: Mutex<Option<SessionHandle>>,
}

impl<F: AssetFetcher + 'static> FrameScheduler<F> {
    pub fn new(
        config: SchedulerConfig,
        policy: DeliveryPolicy<F>,
        sink: mpsc::Sender<RenderFrame>,
    ) -> Self {
        Self {
            config,
            policy,
            generation: Arc::new(AtomicU64::new(0)),
            sink: Arc::new(Mutex::new(sink)),
            active: Mutex::new(None),
        }
    }

    /// Id of the newest session, 0 before the first.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn active_state(&self) -> SessionState {
        lock(&self.active)
            .as_ref()
            .map_or(SessionState::Idle, SessionHandle::state)
    }

    /// Arm a session for `utterance`, cancelling the previous one.
    pub fn arm(&self, utterance: Utterance) -> SessionHandle {
        let mut active = lock(&self.active);
        if let Some(prev) = active.take() {
            prev.cancel();
        }
        let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (state, _) = watch::channel(SessionState::Armed);
        let handle = SessionHandle {
            id,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
            utterance: Arc::new(utterance),
        };
        debug!(
            session = id,
            avatar = %handle.utterance.avatar,
            duration_ms = handle.utterance.duration_ms,
            "scheduler session armed"
        );
        *active = Some(handle.clone());
        handle
    }

    /// Start ticking an armed session against `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Pipeline`] if the session is no longer the
    /// newest or is not armed.
    pub fn start(
        &self,
        handle: &SessionHandle,
        clock: Arc<dyn PlaybackClock>,
    ) -> Result<JoinHandle<SessionState>> {
        if handle.id != self.generation() {
            return Err(PlayerError::Pipeline(format!(
                "session {} superseded by {}",
                handle.id,
                self.generation()
            )));
        }
        if !handle.transition(SessionState::Running) {
            return Err(PlayerError::Pipeline(format!(
                "session {} is {:?}, not armed",
                handle.id,
                handle.state()
            )));
        }

        let utterance = &handle.utterance;
        let cdn = self.policy.locator().config();
        let selector = FrameSelector::new(
            self.config.strategy,
            utterance.track.clone(),
            utterance.duration_ms,
            cdn.avatar(utterance.avatar).total_frames,
            utterance.expression,
        );
        let ticker = Ticker {
            handle: handle.clone(),
            selector,
            preload_ahead: cdn.preload_ahead as usize,
            rate: AdaptiveFrameRate::new(&self.config),
            generation: Arc::clone(&self.generation),
            sink: Arc::clone(&self.sink),
        };
        let delivery = self.policy.session(handle.cancel.clone());
        info!(
            session = handle.id,
            strategy = ?ticker.selector.strategy(),
            "scheduler session running"
        );
        Ok(tokio::spawn(ticker.run(delivery, clock)))
    }

    /// Cancel the live session, if any.
    pub fn stop(&self) {
        if let Some(active) = lock(&self.active).as_ref() {
            active.cancel();
        }
    }
}

struct Ticker {
    handle: SessionHandle,
    selector: FrameSelector,
    preload_ahead: usize,
    rate: AdaptiveFrameRate,
    generation: Arc<AtomicU64>,
    sink: Arc<Mutex<mpsc::Sender<RenderFrame>>>,
}

impl Ticker {
    /// Send `frame` if this session is still the newest. Returns false when
    /// the session must stop.
    fn emit(&self, frame: RenderFrame) -> bool {
        let sink = lock(&self.sink);
        if self.generation.load(Ordering::SeqCst) != self.handle.id
            || self.handle.cancel.is_cancelled()
        {
            return false;
        }
        match sink.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                debug!(
                    session = frame.session,
                    time_ms = frame.time_ms,
                    "renderer behind, frame dropped"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn run<F: AssetFetcher + 'static>(
        mut self,
        mut delivery: avatar_cdn::DeliverySession<F>,
        clock: Arc<dyn PlaybackClock>,
    ) -> SessionState {
        let avatar = self.handle.utterance.avatar;
        let id = self.handle.id;
        let mut last_tick = Instant::now();
        let mut ticks = 0u64;

        let outcome = loop {
            let tick_started = Instant::now();
            let gap = tick_started.duration_since(last_tick);
            last_tick = tick_started;

            let time_ms = clock.current_time_ms();
            let finished = clock.is_finished();
            let selection = self.selector.select(time_ms);
            let handle = delivery.frame_for(&selection.request(avatar));
            delivery.preload(self.selector.upcoming(avatar, time_ms, self.preload_ahead));

            let frame = RenderFrame {
                session: id,
                time_ms,
                selection,
                handle,
                fps: self.rate.fps(),
            };
            if !self.emit(frame) {
                break SessionState::Cancelled;
            }
            ticks += 1;
            if finished {
                break SessionState::Completed;
            }

            let busy = tick_started.elapsed();
            if let Some(fps) = self.rate.record(gap, busy) {
                debug!(session = id, fps, "tick rate adjusted");
            }
            let wait = self.rate.interval().saturating_sub(busy);
            tokio::select! {
                _ = self.handle.cancel.cancelled() => break SessionState::Cancelled,
                _ = tokio::time::sleep(wait) => {}
            }
        };

        if outcome == SessionState::Completed {
            self.handle.transition(SessionState::Completed);
        } else {
            self.handle.transition(SessionState::Cancelled);
        }
        info!(session = id, ticks, state = ?self.handle.state(), "scheduler session ended");
        self.handle.state()
    }
}
