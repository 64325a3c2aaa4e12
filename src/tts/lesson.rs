//! Whole-lesson synthesis.

use std::sync::Arc;

use avatar_cdn::AvatarId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;
use crate::tts::preflight::PreflightFilter;
use crate::tts::{SpeechSynthesizer, Synthesis};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Slide {
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Answer {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Question {
    pub text: String,
    pub answers: Vec<Answer>,
}

/// Lesson script as authored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lesson {
    pub intro: Option<String>,
    pub slides: Vec<Slide>,
    pub questions: Vec<Question>,
}

/// Result for one line of the script.
#[derive(Debug, Clone)]
pub enum LessonLine {
    Voiced(Arc<Synthesis>),
    /// Rejected by the pre-flight filter.
    Skipped(String),
}

impl LessonLine {
    pub fn synthesis(&self) -> Option<&Arc<Synthesis>> {
        match self {
            Self::Voiced(s) => Some(s),
            Self::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuestionAudio {
    pub question: LessonLine,
    pub answers: Vec<LessonLine>,
}

/// Audio for a lesson, shaped like the script.
#[derive(Debug, Clone, Default)]
pub struct LessonAudio {
    pub intro: Option<LessonLine>,
    pub slides: Vec<LessonLine>,
    pub questions: Vec<QuestionAudio>,
}

impl LessonAudio {
    fn lines(&self) -> impl Iterator<Item = &LessonLine> {
        self.intro
            .iter()
            .chain(&self.slides)
            .chain(
                self.questions
                    .iter()
                    .flat_map(|q| std::iter::once(&q.question).chain(&q.answers)),
            )
    }

    pub fn voiced_count(&self) -> usize {
        self.lines().filter(|l| l.synthesis().is_some()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.lines().filter(|l| l.synthesis().is_none()).count()
    }

    /// Total voiced duration in milliseconds.
    pub fn total_duration_ms(&self) -> u64 {
        self.lines()
            .filter_map(LessonLine::synthesis)
            .map(|s| s.duration_ms())
            .sum()
    }
}

async fn voice(
    synthesizer: &dyn SpeechSynthesizer,
    filter: &PreflightFilter,
    text: &str,
    speaker: AvatarId,
    cancel: &CancellationToken,
) -> Result<LessonLine> {
    if let Some(reason) = filter.block_reason(text) {
        return Ok(LessonLine::Skipped(reason));
    }
    Ok(LessonLine::Voiced(
        synthesizer.synthesize(text, speaker, cancel).await?,
    ))
}

/// Synthesize a lesson in order: intro, slides, then each question
/// followed by its answers. One line at a time.
///
/// # Errors
///
/// Fails on the first line that cannot be synthesized. Placeholder lines
/// are skipped, not errors.
pub async fn synthesize_lesson(
    synthesizer: &dyn SpeechSynthesizer,
    filter: &PreflightFilter,
    lesson: &Lesson,
    speaker: AvatarId,
    cancel: &CancellationToken,
) -> Result<LessonAudio> {
    let mut audio = LessonAudio::default();

    if let Some(intro) = lesson.intro.as_deref() {
        audio.intro = Some(voice(synthesizer, filter, intro, speaker, cancel).await?);
    }
    for slide in &lesson.slides {
        audio
            .slides
            .push(voice(synthesizer, filter, &slide.content, speaker, cancel).await?);
    }
    for question in &lesson.questions {
        let voiced = voice(synthesizer, filter, &question.text, speaker, cancel).await?;
        let mut answers = Vec::with_capacity(question.answers.len());
        for answer in &question.answers {
            answers.push(voice(synthesizer, filter, &answer.text, speaker, cancel).await?);
        }
        audio.questions.push(QuestionAudio {
            question: voiced,
            answers,
        });
    }

    info!(
        %speaker,
        voiced = audio.voiced_count(),
        skipped = audio.skipped_count(),
        duration_ms = audio.total_duration_ms(),
        "lesson audio ready"
    );
    Ok(audio)
}
