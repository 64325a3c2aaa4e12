//! Per-tick frame selection.

use avatar_cdn::{AssetRequest, AvatarId, Expression, Viseme};
use serde::Serialize;

use crate::config::FrameStrategy;
use crate::viseme::SpeechTimingTrack;

/// What the scheduler wants painted at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameSelection {
    /// Frame of the full sequence, set by the time strategy.
    pub frame_index: Option<u32>,
    pub viseme: Viseme,
    pub expression: Expression,
    /// Progress through the current timing entry, `0.0..=1.0`.
    pub progress: f32,
    /// Viseme of the following entry, for interpolation.
    pub next_viseme: Option<Viseme>,
}

impl FrameSelection {
    /// The asset request for this selection.
    pub fn request(&self, avatar: AvatarId) -> AssetRequest {
        match (self.frame_index, self.viseme) {
            (Some(index), viseme) => AssetRequest::frame(avatar, index, viseme, self.expression),
            (None, viseme) => AssetRequest::viseme(avatar, viseme, self.expression),
        }
    }
}

/// `floor(t / duration * total_frames)` clamped to `[0, total_frames - 1]`.
pub fn time_frame(time_ms: u64, duration_ms: u64, total_frames: u32) -> u32 {
    if duration_ms == 0 || total_frames == 0 {
        return 0;
    }
    let index = u128::from(time_ms) * u128::from(total_frames) / u128::from(duration_ms);
    index.min(u128::from(total_frames - 1)) as u32
}

/// Index of the timing entry active at `time_ms`, if any.
///
/// Binary search on start time; when several entries start at or before
/// `time_ms` the later-starting one wins.
pub fn entry_index_at(track: &SpeechTimingTrack, time_ms: u64) -> Option<usize> {
    let entries = track.entries();
    let after = entries.partition_point(|e| e.start_ms <= time_ms);
    let index = after.checked_sub(1)?;
    entries[index].contains(time_ms).then_some(index)
}

/// Selects frames for one utterance.
#[derive(Debug, Clone)]
pub struct FrameSelector {
    strategy: FrameStrategy,
    track: Option<std::sync::Arc<SpeechTimingTrack>>,
    duration_ms: u64,
    total_frames: u32,
    expression: Expression,
}

impl FrameSelector {
    /// Without a track carrying speech the time strategy is used.
    pub fn new(
        strategy: FrameStrategy,
        track: Option<std::sync::Arc<SpeechTimingTrack>>,
        duration_ms: u64,
        total_frames: u32,
        expression: Expression,
    ) -> Self {
        let track = track.filter(|t| t.has_speech());
        let strategy = if track.is_none() {
            FrameStrategy::Time
        } else {
            strategy
        };
        Self {
            strategy,
            track,
            duration_ms,
            total_frames,
            expression,
        }
    }

    pub fn strategy(&self) -> FrameStrategy {
        self.strategy
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    fn viseme_at(&self, time_ms: u64) -> (Viseme, f32, Option<Viseme>) {
        let Some(track) = &self.track else {
            return (Viseme::Rest, 0.0, None);
        };
        match entry_index_at(track, time_ms) {
            Some(index) => {
                let entry = &track.entries()[index];
                let progress =
                    (time_ms - entry.start_ms) as f32 / entry.duration_ms().max(1) as f32;
                let next = track.entries().get(index + 1).map(|e| e.viseme);
                (entry.viseme, progress.clamp(0.0, 1.0), next)
            }
            None => (Viseme::Rest, 0.0, None),
        }
    }

    pub fn select(&self, time_ms: u64) -> FrameSelection {
        let (viseme, progress, next_viseme) = self.viseme_at(time_ms);
        match self.strategy {
            FrameStrategy::Phoneme => FrameSelection {
                frame_index: None,
                viseme,
                expression: self.expression,
                progress,
                next_viseme,
            },
            FrameStrategy::Time => {
                let frame_index = time_frame(time_ms, self.duration_ms, self.total_frames);
                let progress = if self.duration_ms == 0 {
                    1.0
                } else {
                    (time_ms as f32 / self.duration_ms as f32).clamp(0.0, 1.0)
                };
                FrameSelection {
                    frame_index: Some(frame_index),
                    viseme,
                    expression: self.expression,
                    progress,
                    next_viseme,
                }
            }
        }
    }

    /// Requests for what comes after `time_ms`, nearest first.
    pub fn upcoming(&self, avatar: AvatarId, time_ms: u64, limit: usize) -> Vec<AssetRequest> {
        match self.strategy {
            FrameStrategy::Phoneme => {
                let Some(track) = &self.track else {
                    return Vec::new();
                };
                let start = entry_index_at(track, time_ms).map_or(0, |i| i + 1);
                let mut seen = Vec::with_capacity(limit);
                for entry in &track.entries()[start.min(track.len())..] {
                    if seen.len() >= limit {
                        break;
                    }
                    if !seen.contains(&entry.viseme) {
                        seen.push(entry.viseme);
                    }
                }
                seen.into_iter()
                    .map(|v| AssetRequest::viseme(avatar, v, self.expression))
                    .collect()
            }
            FrameStrategy::Time => {
                let current = time_frame(time_ms, self.duration_ms, self.total_frames);
                (current + 1..self.total_frames)
                    .take(limit)
                    .map(|index| {
                        let at = u64::from(index) * self.duration_ms / u64::from(self.total_frames);
                        let (viseme, _, _) = self.viseme_at(at);
                        AssetRequest::frame(avatar, index, viseme, self.expression)
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viseme::{PhonemeTiming, VisemeMapper};
    use std::sync::Arc;

    fn track(phonemes: &[(&str, f64, f64)], duration: f64) -> Arc<SpeechTimingTrack> {
        let phonemes: Vec<PhonemeTiming> = phonemes
            .iter()
            .map(|(p, s, e)| PhonemeTiming {
                phoneme: (*p).to_owned(),
                start: *s,
                end: *e,
            })
            .collect();
        Arc::new(SpeechTimingTrack::from_phonemes(
            &phonemes,
            duration,
            &VisemeMapper::default(),
            "en",
        ))
    }

    #[test]
    fn time_strategy_examples() {
        assert_eq!(time_frame(5000, 10000, 365), 182);
        assert_eq!(time_frame(0, 10000, 365), 0);
        assert_eq!(time_frame(10000, 10000, 365), 364);
        assert_eq!(time_frame(20000, 10000, 365), 364);
        assert_eq!(time_frame(100, 0, 365), 0);
    }

    #[test]
    fn lookup_finds_containing_entry() {
        let t = track(&[("A", 0.0, 0.1), ("MBP", 0.1, 0.3)], 0.4);
        let selector = FrameSelector::new(
            FrameStrategy::Phoneme,
            Some(t),
            400,
            365,
            Expression::Neutral,
        );
        assert_eq!(selector.select(50).viseme, Viseme::A);
        assert_eq!(selector.select(100).viseme, Viseme::Mbp);
        assert_eq!(selector.select(350).viseme, Viseme::Rest);
        assert_eq!(selector.select(900).viseme, Viseme::Rest);
    }

    #[test]
    fn boundary_resolves_to_later_entry() {
        let t = track(&[("A", 0.0, 0.2), ("E", 0.2, 0.4)], 0.4);
        assert_eq!(entry_index_at(&t, 200), Some(1));
        assert_eq!(entry_index_at(&t, 199), Some(0));
    }

    #[test]
    fn progress_and_next_viseme() {
        let t = track(&[("A", 0.0, 0.2), ("E", 0.2, 0.4)], 0.4);
        let selector = FrameSelector::new(
            FrameStrategy::Phoneme,
            Some(t),
            400,
            365,
            Expression::Neutral,
        );
        let sel = selector.select(50);
        assert!((sel.progress - 0.25).abs() < 1e-6);
        assert_eq!(sel.next_viseme, Some(Viseme::E));
        assert_eq!(sel.frame_index, None);
        assert_eq!(selector.select(300).next_viseme, None);
    }

    #[test]
    fn no_track_falls_back_to_time() {
        let selector = FrameSelector::new(
            FrameStrategy::Phoneme,
            None,
            10000,
            365,
            Expression::Neutral,
        );
        assert_eq!(selector.strategy(), FrameStrategy::Time);
        let sel = selector.select(5000);
        assert_eq!(sel.frame_index, Some(182));
        assert_eq!(sel.viseme, Viseme::Rest);
    }

    #[test]
    fn silent_track_falls_back_to_time() {
        let t = track(&[("sil", 0.0, 0.5)], 1.0);
        let selector = FrameSelector::new(
            FrameStrategy::Phoneme,
            Some(t),
            1000,
            365,
            Expression::Neutral,
        );
        assert_eq!(selector.strategy(), FrameStrategy::Time);
    }

    #[test]
    fn requests_follow_strategy() {
        let t = track(&[("A", 0.0, 0.2)], 0.4);
        let phoneme = FrameSelector::new(
            FrameStrategy::Phoneme,
            Some(t.clone()),
            400,
            365,
            Expression::Neutral,
        );
        let req = phoneme.select(10).request(AvatarId::Kelly);
        assert_eq!(req.frame, None);
        assert_eq!(req.viseme, Some(Viseme::A));

        let time = FrameSelector::new(FrameStrategy::Time, Some(t), 400, 365, Expression::Neutral);
        let req = time.select(10).request(AvatarId::Ken);
        assert_eq!(req.frame, Some(9));
        assert_eq!(req.viseme, Some(Viseme::A));
    }

    #[test]
    fn upcoming_frames_and_visemes() {
        let t = track(
            &[("A", 0.0, 0.1), ("E", 0.1, 0.2), ("A", 0.2, 0.3), ("O", 0.3, 0.4)],
            0.4,
        );
        let phoneme = FrameSelector::new(
            FrameStrategy::Phoneme,
            Some(t.clone()),
            400,
            365,
            Expression::Neutral,
        );
        let visemes: Vec<_> = phoneme
            .upcoming(AvatarId::Kelly, 50, 10)
            .iter()
            .map(|r| r.viseme)
            .collect();
        assert_eq!(visemes, [Some(Viseme::E), Some(Viseme::A), Some(Viseme::O)]);

        let time = FrameSelector::new(FrameStrategy::Time, Some(t), 400, 365, Expression::Neutral);
        let frames: Vec<_> = time
            .upcoming(AvatarId::Kelly, 0, 10)
            .iter()
            .map(|r| r.frame)
            .collect();
        assert_eq!(frames.len(), 10);
        assert_eq!(frames[0], Some(1));
        assert!(time.upcoming(AvatarId::Kelly, 400, 10).is_empty());
    }
}
