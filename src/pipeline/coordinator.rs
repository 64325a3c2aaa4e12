//! Lesson player that wires all stages together.
//!
//! A line of text goes through the pre-flight filter, the synthesis
//! service and the viseme mapper, then plays through the audio binder while
//! the frame scheduler follows the binder's clock and streams frames to the
//! renderer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use avatar_cdn::manifest::warm_from_manifest;
use avatar_cdn::{
    AssetFetcher, AssetManifest, AvatarId, DeliveryPolicy, Expression, HttpAssetFetcher,
    SharedBreaker,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::PlaybackBinder;
use crate::config::{FrameStrategy, PlayerConfig};
use crate::error::{PlayerError, Result};
use crate::pipeline::messages::{PlayerStatus, SpeakOutcome, WarmUpReport};
use crate::scheduler::{FrameScheduler, RenderFrame, SessionState, Utterance};
use crate::tts::lesson::LessonLine;
use crate::tts::{
    Lesson, PreflightFilter, RemoteSynthesizer, SpeechSynthesizer, Synthesis, SynthesisHealth,
    synthesize_lesson,
};
use crate::viseme::{SpeechTimingTrack, VisemeMapper};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Talking-avatar lesson player.
///
/// One line plays at a time. Speaking again, or calling [`Self::stop`],
/// interrupts the line in progress wherever it is: synthesis, waiting for
/// the unlock gate, or playback.
pub struct LessonPlayer<F> {
    config: PlayerConfig,
    mapper: VisemeMapper,
    preflight: PreflightFilter,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    delivery: DeliveryPolicy<F>,
    scheduler: FrameScheduler<F>,
    binder: PlaybackBinder,
    /// Token of the line in progress.
    current: Mutex<CancellationToken>,
    /// Serialises arming the scheduler with starting playback.
    setup: Mutex<()>,
    shutdown: CancellationToken,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl LessonPlayer<HttpAssetFetcher> {
    /// Build a player over the real synthesis service and avatar CDN.
    ///
    /// Both share one circuit breaker. Returns the player and the channel
    /// the renderer reads frames from.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Config`] for an invalid configuration.
    pub fn connect(
        config: PlayerConfig,
        binder: PlaybackBinder,
    ) -> Result<(Self, mpsc::Receiver<RenderFrame>)> {
        config.validate()?;
        let breaker = SharedBreaker::new(config.cdn.circuit_breaker.clone());
        let synthesizer =
            RemoteSynthesizer::new(&config.synthesis, &config.cache, breaker.clone())?;
        let delivery = avatar_cdn::http_policy(config.cdn.clone(), breaker)
            .map_err(|e| PlayerError::Config(e.to_string()))?;
        let (tx, rx) = mpsc::channel(config.scheduler.channel_capacity);
        let player = Self::new(config, Arc::new(synthesizer), delivery, binder, tx)?;
        Ok((player, rx))
    }
}

impl<F: AssetFetcher + 'static> LessonPlayer<F> {
    /// Assemble a player from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Config`] for an invalid configuration.
    pub fn new(
        config: PlayerConfig,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        delivery: DeliveryPolicy<F>,
        binder: PlaybackBinder,
        frames: mpsc::Sender<RenderFrame>,
    ) -> Result<Self> {
        config.validate()?;
        let mapper =
            VisemeMapper::with_tables(&config.lipsync.default_language, &config.lipsync.tables);
        let preflight = PreflightFilter::new(&config.preflight);
        let scheduler = FrameScheduler::new(config.scheduler.clone(), delivery.clone(), frames);
        let shutdown = CancellationToken::new();
        info!(
            avatar = %config.avatar,
            tier = %delivery.tier(),
            strategy = ?config.scheduler.strategy,
            "lesson player ready"
        );
        Ok(Self {
            current: Mutex::new(shutdown.child_token()),
            config,
            mapper,
            preflight,
            synthesizer,
            delivery,
            scheduler,
            binder,
            setup: Mutex::new(()),
            shutdown,
            probe: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn delivery(&self) -> &DeliveryPolicy<F> {
        &self.delivery
    }

    pub fn binder(&self) -> &PlaybackBinder {
        &self.binder
    }

    /// Speak `text` as the configured avatar.
    ///
    /// # Errors
    ///
    /// See [`Self::speak_as`].
    pub async fn speak(&self, text: &str) -> Result<SpeakOutcome> {
        self.speak_as(text, self.config.avatar, Expression::TeachingExplaining)
            .await
    }

    /// Speak `text` as `avatar`, resolving when the line has played out.
    ///
    /// Blocked text and interruptions are outcomes, not errors.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::SynthesisUnavailable`] when no audio could be
    /// produced, or an audio error if playback fails.
    pub async fn speak_as(
        &self,
        text: &str,
        avatar: AvatarId,
        expression: Expression,
    ) -> Result<SpeakOutcome> {
        if let Some(reason) = self.preflight.block_reason(text) {
            warn!(%reason, "line blocked before synthesis");
            return Ok(SpeakOutcome::Blocked { reason });
        }
        let cancel = self.supersede();
        let synthesis = match self.synthesizer.synthesize(text, avatar, &cancel).await {
            Ok(synthesis) => synthesis,
            Err(PlayerError::Interrupted) => return Ok(SpeakOutcome::Interrupted),
            Err(e) => {
                warn!(%avatar, error = %e, "synthesis failed");
                return Err(e);
            }
        };
        self.perform(&synthesis, avatar, expression, &cancel).await
    }

    /// Synthesize a whole lesson, then play it line by line.
    ///
    /// Stops at the first interruption. Blocked lines are reported and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Fails if any line cannot be synthesized or played.
    pub async fn play_lesson(
        &self,
        lesson: &Lesson,
        avatar: AvatarId,
    ) -> Result<Vec<SpeakOutcome>> {
        let cancel = self.supersede();
        let audio =
            match synthesize_lesson(&*self.synthesizer, &self.preflight, lesson, avatar, &cancel)
                .await
            {
                Ok(audio) => audio,
                Err(PlayerError::Interrupted) => return Ok(vec![SpeakOutcome::Interrupted]),
                Err(e) => return Err(e),
            };

        let mut script: Vec<(&LessonLine, Expression)> = Vec::new();
        if let Some(intro) = &audio.intro {
            script.push((intro, Expression::WelcomingEngaging));
        }
        script.extend(audio.slides.iter().map(|l| (l, Expression::TeachingExplaining)));
        for question in &audio.questions {
            script.push((&question.question, Expression::QuestionCurious));
            script.extend(question.answers.iter().map(|l| (l, Expression::TeachingExplaining)));
        }

        let mut outcomes = Vec::with_capacity(script.len());
        for (line, expression) in script {
            let outcome = match line {
                LessonLine::Voiced(synthesis) => {
                    self.perform(synthesis, avatar, expression, &cancel).await?
                }
                LessonLine::Skipped(reason) => SpeakOutcome::Blocked {
                    reason: reason.clone(),
                },
            };
            let interrupted = outcome == SpeakOutcome::Interrupted;
            outcomes.push(outcome);
            if interrupted {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Cancel the previous line and hand out a token for the next one.
    fn supersede(&self) -> CancellationToken {
        let next = self.shutdown.child_token();
        let previous = std::mem::replace(&mut *lock(&self.current), next.clone());
        previous.cancel();
        next
    }

    async fn perform(
        &self,
        synthesis: &Synthesis,
        avatar: AvatarId,
        expression: Expression,
        cancel: &CancellationToken,
    ) -> Result<SpeakOutcome> {
        let duration_ms = synthesis.duration_ms();
        let track = (!synthesis.phonemes.is_empty()).then(|| {
            Arc::new(SpeechTimingTrack::from_phonemes(
                &synthesis.phonemes,
                duration_ms as f64 / 1000.0,
                &self.mapper,
                self.mapper.default_language(),
            ))
        });
        let strategy = match &track {
            Some(track) if track.has_speech() => self.config.scheduler.strategy,
            _ => FrameStrategy::Time,
        };

        let (handle, playback, ticks) = {
            let _setup = lock(&self.setup);
            if cancel.is_cancelled() {
                return Ok(SpeakOutcome::Interrupted);
            }
            let handle = self.scheduler.arm(Utterance {
                avatar,
                track,
                duration_ms,
                expression,
            });
            let playback = self.binder.begin(synthesis.audio.clone());
            let ticks = match self.scheduler.start(&handle, Arc::new(playback.clock())) {
                Ok(ticks) => ticks,
                Err(e) => {
                    self.binder.stop();
                    return Err(e);
                }
            };
            (handle, playback, ticks)
        };
        if !self.binder.gate().is_unlocked() {
            info!(session = handle.id(), "line queued until playback is unlocked");
        }

        let stop_playback = playback.cancel_token().clone();
        let run = playback.run();
        tokio::pin!(run);
        let finished = tokio::select! {
            result = &mut run => Some(result),
            _ = cancel.cancelled() => None,
        };
        let played = match finished {
            Some(result) => result,
            None => {
                stop_playback.cancel();
                run.await
            }
        };

        match played {
            Ok(()) => {
                let state = ticks
                    .await
                    .map_err(|e| PlayerError::Pipeline(format!("scheduler task failed: {e}")))?;
                if state == SessionState::Completed {
                    info!(session = handle.id(), duration_ms, "line played");
                    Ok(SpeakOutcome::Completed {
                        session: handle.id(),
                        duration_ms,
                        strategy,
                    })
                } else {
                    Ok(SpeakOutcome::Interrupted)
                }
            }
            Err(PlayerError::Interrupted) => {
                handle.cancel();
                debug!(session = handle.id(), "line interrupted");
                Ok(SpeakOutcome::Interrupted)
            }
            Err(e) => {
                handle.cancel();
                warn!(session = handle.id(), error = %e, "playback failed");
                Err(e)
            }
        }
    }

    /// Interrupt the line in progress, if any.
    pub fn stop(&self) {
        // Never lands between arming a line and starting it.
        let _setup = lock(&self.setup);
        lock(&self.current).cancel();
        self.scheduler.stop();
        self.binder.stop();
    }

    /// Release playback after a user gesture. Returns true the first time.
    pub fn unlock(&self) -> bool {
        let unlocked = self.binder.gate().unlock();
        if unlocked {
            info!("playback unlocked");
        }
        unlocked
    }

    pub fn status(&self) -> PlayerStatus {
        let playing = self.binder.is_playing();
        PlayerStatus {
            tier: self.delivery.tier(),
            circuits: self.delivery.circuits(),
            cache: self.delivery.cache_stats(),
            session: self.scheduler.active_state(),
            generation: self.scheduler.generation(),
            playing,
            playback_blocked: playing && !self.binder.gate().is_unlocked(),
            level: self.binder.level(),
        }
    }

    /// Operator reset: close every circuit, synthesis included, and return
    /// delivery to its initial tier.
    pub fn reset(&self) {
        self.delivery.reset();
    }

    /// Health of the synthesis service.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::SynthesisUnavailable`] if it does not answer.
    pub async fn synthesis_health(&self) -> Result<SynthesisHealth> {
        self.synthesizer.health().await
    }

    /// Load the critical expressions for every avatar, plus the manifest's
    /// preload list when one is configured. Failures are logged, not fatal.
    pub async fn warm_up(&self) -> WarmUpReport {
        let cancel = self.shutdown.child_token();
        let manifest = match &self.config.delivery.manifest_path {
            Some(path) => match AssetManifest::from_file(path) {
                Ok(manifest) => Some(manifest),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "asset manifest unavailable");
                    None
                }
            },
            None => None,
        };

        let mut report = WarmUpReport::default();
        for &avatar in AvatarId::all() {
            report.expressions += self
                .delivery
                .warm_up(avatar, &self.config.delivery.warm_up_expressions, &cancel)
                .await;
            if let Some(manifest) = &manifest {
                report.manifest +=
                    warm_from_manifest(&self.delivery, manifest, avatar, &cancel).await;
            }
        }
        report
    }

    /// Start the background probe that promotes the delivery tier again
    /// once the CDN recovers. Returns whether a probe is running.
    pub fn start_health_probe(&self) -> bool {
        if !self.config.delivery.health_probe {
            return false;
        }
        let mut probe = lock(&self.probe);
        if probe.is_none() {
            *probe = self.delivery.spawn_health_probe(self.shutdown.child_token());
        }
        probe.is_some()
    }

    /// Stop playback and every background task.
    pub fn shutdown(&self) {
        self.stop();
        self.shutdown.cancel();
        lock(&self.probe).take();
        info!("lesson player shut down");
    }
}

impl<F> Drop for LessonPlayer<F> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::DecodedAudio;
    use crate::config::AudioConfig;
    use crate::viseme::PhonemeTiming;
    use async_trait::async_trait;
    use avatar_cdn::{CdnConfig, Viseme};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct InstantFetcher;

    impl AssetFetcher for InstantFetcher {
        fn fetch(
            &self,
            _url: &str,
        ) -> impl std::future::Future<Output = avatar_cdn::Result<Bytes>> + Send {
            async { Ok(Bytes::from_static(b"png")) }
        }

        fn probe(
            &self,
            _url: &str,
        ) -> impl std::future::Future<Output = avatar_cdn::Result<()>> + Send {
            async { Ok(()) }
        }
    }

    #[derive(Default)]
    struct FakeSynth {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynth {
        async fn synthesize(
            &self,
            text: &str,
            speaker: AvatarId,
            _cancel: &CancellationToken,
        ) -> Result<Arc<Synthesis>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PlayerError::SynthesisUnavailable("HTTP 503".into()));
            }
            // "long" lines last two seconds, everything else 300 ms.
            let ms = if text.contains("long") { 2000 } else { 300 };
            Ok(Arc::new(Synthesis {
                text: text.to_owned(),
                speaker,
                audio: DecodedAudio::new(vec![0.1; 16 * ms], 16000),
                duration_secs: ms as f64 / 1000.0,
                phonemes: vec![
                    PhonemeTiming {
                        phoneme: "HH".into(),
                        start: 0.0,
                        end: 0.1,
                    },
                    PhonemeTiming {
                        phoneme: "AA1".into(),
                        start: 0.1,
                        end: 0.25,
                    },
                ],
                engine: Some("fake".into()),
            }))
        }

        async fn health(&self) -> Result<SynthesisHealth> {
            Ok(SynthesisHealth {
                status: "healthy".into(),
                voices: vec!["kelly".into(), "ken".into()],
                ..Default::default()
            })
        }
    }

    fn player_with(
        synth: Arc<FakeSynth>,
        audio: AudioConfig,
    ) -> (Arc<LessonPlayer<InstantFetcher>>, mpsc::Receiver<RenderFrame>) {
        let config = PlayerConfig {
            audio: audio.clone(),
            ..PlayerConfig::default()
        };
        let delivery = DeliveryPolicy::new(
            Arc::new(CdnConfig::default()),
            InstantFetcher,
            SharedBreaker::default(),
        );
        let (tx, rx) = mpsc::channel(1024);
        let binder = PlaybackBinder::headless(&audio);
        let player = LessonPlayer::new(config, synth, delivery, binder, tx).unwrap();
        (Arc::new(player), rx)
    }

    fn fast_audio() -> AudioConfig {
        AudioConfig {
            realtime: false,
            ..AudioConfig::default()
        }
    }

    fn realtime_audio() -> AudioConfig {
        AudioConfig {
            realtime: true,
            ..AudioConfig::default()
        }
    }

    #[tokio::test]
    async fn speak_plays_and_streams_frames() {
        let (player, mut rx) = player_with(Arc::default(), fast_audio());
        let outcome = player.speak("Hello there").await.unwrap();
        let SpeakOutcome::Completed {
            session,
            duration_ms,
            strategy,
        } = outcome
        else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(duration_ms, 300);
        assert_eq!(strategy, FrameStrategy::Phoneme);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.session == session));
        assert_eq!(frames.last().unwrap().selection.viseme, Viseme::Rest);
        assert_eq!(player.status().session, SessionState::Completed);
    }

    #[tokio::test]
    async fn blocked_line_is_a_no_op() {
        let synth = Arc::new(FakeSynth::default());
        let (player, mut rx) = player_with(Arc::clone(&synth), fast_audio());
        let outcome = player.speak("Vitamin Cue").await.unwrap();
        assert!(matches!(outcome, SpeakOutcome::Blocked { .. }));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 0);
        assert_eq!(player.status().generation, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn synthesis_failure_is_reported() {
        let synth = Arc::new(FakeSynth {
            fail: true,
            ..Default::default()
        });
        let (player, _rx) = player_with(synth, fast_audio());
        let err = player.speak("Hello").await.unwrap_err();
        assert!(matches!(err, PlayerError::SynthesisUnavailable(_)));
        assert_eq!(player.status().session, SessionState::Idle);
    }

    #[tokio::test]
    async fn stop_interrupts_the_line() {
        let (player, _rx) = player_with(Arc::default(), realtime_audio());
        let task = {
            let player = Arc::clone(&player);
            tokio::spawn(async move { player.speak("a long line").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(player.status().playing);
        player.stop();
        assert_eq!(task.await.unwrap().unwrap(), SpeakOutcome::Interrupted);
        assert_eq!(player.status().session, SessionState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_racing_line_setup_always_interrupts_cleanly() {
        let (player, _rx) = player_with(Arc::default(), fast_audio());
        let done = CancellationToken::new();
        let stopper = {
            let player = Arc::clone(&player);
            let done = done.clone();
            tokio::spawn(async move {
                while !done.is_cancelled() {
                    player.stop();
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..100 {
            let outcome = player.speak("Hello there").await.unwrap();
            assert!(matches!(
                outcome,
                SpeakOutcome::Completed { .. } | SpeakOutcome::Interrupted
            ));
        }
        done.cancel();
        stopper.await.unwrap();
        assert!(!player.status().playing);
    }

    #[tokio::test]
    async fn next_line_supersedes_the_current_one() {
        let (player, _rx) = player_with(Arc::default(), realtime_audio());
        let first = {
            let player = Arc::clone(&player);
            tokio::spawn(async move { player.speak("a long line").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = player.speak("short").await.unwrap();
        assert!(second.is_completed());
        assert_eq!(first.await.unwrap().unwrap(), SpeakOutcome::Interrupted);
    }

    #[tokio::test]
    async fn locked_player_waits_for_unlock() {
        let audio = AudioConfig {
            require_unlock: true,
            ..fast_audio()
        };
        let (player, _rx) = player_with(Arc::default(), audio);
        let task = {
            let player = Arc::clone(&player);
            tokio::spawn(async move { player.speak("Welcome").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = player.status();
        assert!(status.playback_blocked);
        assert_eq!(status.session, SessionState::Running);

        assert!(player.unlock());
        assert!(!player.unlock());
        assert!(task.await.unwrap().unwrap().is_completed());
    }

    #[tokio::test]
    async fn lesson_plays_in_order_and_reports_skips() {
        let synth = Arc::new(FakeSynth::default());
        let (player, _rx) = player_with(Arc::clone(&synth), fast_audio());
        let lesson: Lesson = serde_json::from_str(
            r#"{
                "intro": "Welcome",
                "slides": [{"content": "placeholder"}, {"content": "Sunlight helps."}],
                "questions": [{"text": "Ready?", "answers": [{"text": "Yes"}]}]
            }"#,
        )
        .unwrap();
        let outcomes = player.play_lesson(&lesson, AvatarId::Ken).await.unwrap();
        assert_eq!(outcomes.len(), 5);
        assert!(matches!(outcomes[1], SpeakOutcome::Blocked { .. }));
        assert_eq!(outcomes.iter().filter(|o| o.is_completed()).count(), 4);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn warm_up_loads_critical_expressions() {
        let (player, _rx) = player_with(Arc::default(), fast_audio());
        let report = player.warm_up().await;
        assert_eq!(report.expressions, 2 * 3);
        assert_eq!(report.manifest, 0);
        assert!(player.status().cache.entries > 0);
    }

    #[tokio::test]
    async fn health_probe_starts_once_and_stops_on_shutdown() {
        let (player, _rx) = player_with(Arc::default(), fast_audio());
        assert!(player.start_health_probe());
        assert!(player.start_health_probe());
        player.shutdown();
        assert!(lock(&player.probe).is_none());
    }

    #[tokio::test]
    async fn synthesis_health_passes_through() {
        let (player, _rx) = player_with(Arc::default(), fast_audio());
        let health = player.synthesis_health().await.unwrap();
        assert!(health.is_healthy());
        assert!(health.has_voice(AvatarId::Kelly));
    }
}
