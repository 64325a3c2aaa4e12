//! Per-utterance speech timing track.

use avatar_cdn::Viseme;
use serde::{Deserialize, Serialize};

use super::VisemeMapper;

/// One phoneme as reported by the synthesis service (times in seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhonemeTiming {
    pub phoneme: String,
    pub start: f64,
    pub end: f64,
}

/// A viseme held over `[start_ms, end_ms)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimingEntry {
    /// Source token, or empty for filled gaps.
    pub token: String,
    pub viseme: Viseme,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimingEntry {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }

    pub fn contains(&self, time_ms: u64) -> bool {
        self.start_ms <= time_ms && time_ms < self.end_ms
    }
}

/// Sorted, non-overlapping viseme entries covering `[0, duration_ms)`.
///
/// Gaps in the reported phonemes are filled with [`Viseme::Rest`] entries,
/// so every instant of the utterance maps to exactly one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpeechTimingTrack {
    entries: Vec<TimingEntry>,
    duration_ms: u64,
}

fn seconds_to_ms(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    }
}

impl SpeechTimingTrack {
    /// Build a track from reported phonemes.
    ///
    /// Entries are sorted by start, clipped to the utterance, and trimmed so
    /// an entry ends where the next one begins. Entries left empty are
    /// dropped. When `duration_secs` is zero the end of the last phoneme is
    /// used instead.
    pub fn from_phonemes(
        phonemes: &[PhonemeTiming],
        duration_secs: f64,
        mapper: &VisemeMapper,
        language: &str,
    ) -> Self {
        let mut raw: Vec<(String, Viseme, u64, u64)> = phonemes
            .iter()
            .map(|p| {
                (
                    p.phoneme.clone(),
                    mapper.map_to_viseme(&p.phoneme, language),
                    seconds_to_ms(p.start),
                    seconds_to_ms(p.end),
                )
            })
            .collect();
        raw.sort_by_key(|(_, _, start, _)| *start);

        let mut duration_ms = seconds_to_ms(duration_secs);
        if duration_ms == 0 {
            duration_ms = raw.iter().map(|(_, _, _, end)| *end).max().unwrap_or(0);
        }

        let mut entries = Vec::with_capacity(raw.len() * 2 + 1);
        let mut cursor = 0;
        for (i, (token, viseme, start, end)) in raw.iter().enumerate() {
            let start = (*start).max(cursor).min(duration_ms);
            let next_start = raw.get(i + 1).map_or(u64::MAX, |next| next.2);
            let end = (*end).min(next_start).min(duration_ms);
            if end <= start {
                continue;
            }
            if start > cursor {
                entries.push(rest(cursor, start));
            }
            entries.push(TimingEntry {
                token: token.clone(),
                viseme: *viseme,
                start_ms: start,
                end_ms: end,
            });
            cursor = end;
        }
        if cursor < duration_ms {
            entries.push(rest(cursor, duration_ms));
        }

        Self {
            entries,
            duration_ms,
        }
    }

    pub fn entries(&self) -> &[TimingEntry] {
        &self.entries
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Whether the track carries any spoken (non-rest) entry.
    pub fn has_speech(&self) -> bool {
        self.entries.iter().any(|e| e.viseme != Viseme::Rest)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn rest(start_ms: u64, end_ms: u64) -> TimingEntry {
    TimingEntry {
        token: String::new(),
        viseme: Viseme::Rest,
        start_ms,
        end_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(phoneme: &str, start: f64, end: f64) -> PhonemeTiming {
        PhonemeTiming {
            phoneme: phoneme.to_owned(),
            start,
            end,
        }
    }

    fn assert_contiguous(track: &SpeechTimingTrack) {
        let mut cursor = 0;
        for entry in track.entries() {
            assert_eq!(entry.start_ms, cursor);
            assert!(entry.end_ms > entry.start_ms);
            cursor = entry.end_ms;
        }
        assert_eq!(cursor, track.duration_ms());
    }

    #[test]
    fn gaps_are_filled_with_rest() {
        let mapper = VisemeMapper::default();
        let track = SpeechTimingTrack::from_phonemes(
            &[p("A", 0.1, 0.2), p("MBP", 0.3, 0.4)],
            0.5,
            &mapper,
            "en",
        );
        let visemes: Vec<Viseme> = track.entries().iter().map(|e| e.viseme).collect();
        assert_eq!(
            visemes,
            [
                Viseme::Rest,
                Viseme::A,
                Viseme::Rest,
                Viseme::Mbp,
                Viseme::Rest
            ]
        );
        assert_contiguous(&track);
        assert_eq!(track.duration_ms(), 500);
    }

    #[test]
    fn unsorted_and_overlapping_input_is_normalised() {
        let mapper = VisemeMapper::default();
        let track = SpeechTimingTrack::from_phonemes(
            &[p("E", 0.2, 0.6), p("A", 0.0, 0.3), p("REST", 0.6, 0.6)],
            0.6,
            &mapper,
            "en",
        );
        assert_eq!(track.len(), 2);
        assert_eq!(track.entries()[0].viseme, Viseme::A);
        assert_eq!(track.entries()[0].end_ms, 200);
        assert_eq!(track.entries()[1].viseme, Viseme::E);
        assert_contiguous(&track);
    }

    #[test]
    fn zero_duration_uses_last_phoneme_end() {
        let mapper = VisemeMapper::default();
        let track = SpeechTimingTrack::from_phonemes(&[p("A", 0.0, 0.25)], 0.0, &mapper, "en");
        assert_eq!(track.duration_ms(), 250);
        assert!(track.has_speech());
    }

    #[test]
    fn phonemes_past_the_end_are_clipped() {
        let mapper = VisemeMapper::default();
        let track = SpeechTimingTrack::from_phonemes(
            &[p("A", 0.0, 0.5), p("E", 1.5, 2.0)],
            1.0,
            &mapper,
            "en",
        );
        assert_eq!(track.entries().last().map(|e| e.end_ms), Some(1000));
        assert!(track.entries().iter().all(|e| e.viseme != Viseme::E));
        assert_contiguous(&track);
    }

    #[test]
    fn no_phonemes_is_a_single_rest_entry() {
        let mapper = VisemeMapper::default();
        let track = SpeechTimingTrack::from_phonemes(&[], 2.0, &mapper, "en");
        assert_eq!(track.len(), 1);
        assert!(!track.has_speech());
    }

    #[test]
    fn negative_and_nan_times_clamp_to_zero() {
        let mapper = VisemeMapper::default();
        let track = SpeechTimingTrack::from_phonemes(
            &[p("A", f64::NAN, 0.1), p("E", -1.0, 0.2)],
            0.2,
            &mapper,
            "en",
        );
        assert_contiguous(&track);
    }
}
