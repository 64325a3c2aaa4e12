//! Core identifiers for avatar assets: avatars, expressions, visemes,
//! delivery tiers and resolved asset handles.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The avatars a lesson can be presented by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarId {
    /// Kelly, the default presenter.
    #[default]
    Kelly,
    /// Ken.
    Ken,
}

impl AvatarId {
    /// Lowercase namespace used in asset paths and speaker ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kelly => "kelly",
            Self::Ken => "ken",
        }
    }

    /// All avatars.
    pub fn all() -> &'static [AvatarId] {
        &[Self::Kelly, Self::Ken]
    }

    /// Parse leniently: anything that is not `ken` (any case) is Kelly.
    pub fn normalise(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }
}

impl fmt::Display for AvatarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AvatarId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kelly" => Ok(Self::Kelly),
            "ken" => Ok(Self::Ken),
            other => Err(format!("unknown avatar '{other}'")),
        }
    }
}

/// Named semantic facial states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    #[default]
    Neutral,
    TeachingExplaining,
    QuestionCurious,
    ConcernedThinking,
    HappyCelebrating,
    WelcomingEngaging,
    ExcitedCelebrating,
}

impl Expression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::TeachingExplaining => "teaching_explaining",
            Self::QuestionCurious => "question_curious",
            Self::ConcernedThinking => "concerned_thinking",
            Self::HappyCelebrating => "happy_celebrating",
            Self::WelcomingEngaging => "welcoming_engaging",
            Self::ExcitedCelebrating => "excited_celebrating",
        }
    }

    pub fn all() -> &'static [Expression] {
        &[
            Self::Neutral,
            Self::TeachingExplaining,
            Self::QuestionCurious,
            Self::ConcernedThinking,
            Self::HappyCelebrating,
            Self::WelcomingEngaging,
            Self::ExcitedCelebrating,
        ]
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Expression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        // `neutral_default` is the file-name spelling used by the base states.
        if lowered == "neutral_default" {
            return Ok(Self::Neutral);
        }
        Self::all()
            .iter()
            .copied()
            .find(|e| e.as_str() == lowered)
            .ok_or_else(|| format!("unknown expression '{lowered}'"))
    }
}

/// Mouth-shape categories used for frame lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Viseme {
    /// Open jaw (ah, aa).
    A,
    /// Mid spread (eh, ey).
    E,
    /// Wide spread (ih, iy).
    I,
    /// Rounded open (oh, ow).
    O,
    /// Rounded small (uw, oo).
    U,
    /// Lips pressed together.
    #[serde(rename = "MBP")]
    Mbp,
    /// Teeth on lower lip.
    #[serde(rename = "FV")]
    Fv,
    /// Tongue between teeth.
    #[serde(rename = "TH")]
    Th,
    /// Tongue at the alveolar ridge (d, n, t, l).
    #[serde(rename = "DNTL")]
    Dntl,
    /// Back of tongue raised.
    #[serde(rename = "KG")]
    Kg,
    /// Sibilants.
    S,
    /// Retroflex r.
    R,
    /// Rounded glide (w, q).
    #[serde(rename = "WQ")]
    Wq,
    /// Mouth closed at rest; silence and anything unknown.
    #[default]
    #[serde(rename = "REST")]
    Rest,
}

impl Viseme {
    /// Canonical uppercase name, as used in asset file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::E => "E",
            Self::I => "I",
            Self::O => "O",
            Self::U => "U",
            Self::Mbp => "MBP",
            Self::Fv => "FV",
            Self::Th => "TH",
            Self::Dntl => "DNTL",
            Self::Kg => "KG",
            Self::S => "S",
            Self::R => "R",
            Self::Wq => "WQ",
            Self::Rest => "REST",
        }
    }

    pub fn all() -> &'static [Viseme] {
        &[
            Self::A,
            Self::E,
            Self::I,
            Self::O,
            Self::U,
            Self::Mbp,
            Self::Fv,
            Self::Th,
            Self::Dntl,
            Self::Kg,
            Self::S,
            Self::R,
            Self::Wq,
            Self::Rest,
        ]
    }

    /// Case-insensitive lookup of a canonical viseme name.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        Self::all().iter().copied().find(|v| v.as_str() == upper)
    }
}

impl fmt::Display for Viseme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fidelity levels of asset delivery, highest first.
///
/// Ordering follows fidelity: `FullFrames < Visemes < ... < StaticNeutral`,
/// so "degrading" means moving to a *greater* value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryTier {
    FullFrames,
    Visemes,
    Expressions,
    StaticNeutral,
}

impl DeliveryTier {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FullFrames => "full_frames",
            Self::Visemes => "visemes",
            Self::Expressions => "expressions",
            Self::StaticNeutral => "static_neutral",
        }
    }

    /// The next lower-fidelity tier, or `None` at the bottom.
    pub fn degraded(&self) -> Option<Self> {
        match self {
            Self::FullFrames => Some(Self::Visemes),
            Self::Visemes => Some(Self::Expressions),
            Self::Expressions => Some(Self::StaticNeutral),
            Self::StaticNeutral => None,
        }
    }

    /// The next higher-fidelity tier, or `None` at the top.
    pub fn promoted(&self) -> Option<Self> {
        match self {
            Self::FullFrames => None,
            Self::Visemes => Some(Self::FullFrames),
            Self::Expressions => Some(Self::Visemes),
            Self::StaticNeutral => Some(Self::Expressions),
        }
    }

    /// The remote backend serving this tier. `StaticNeutral` is local only.
    pub fn backend(&self) -> Option<Backend> {
        match self {
            Self::FullFrames => Some(Backend::FullFrames),
            Self::Visemes => Some(Backend::Visemes),
            Self::Expressions => Some(Backend::Expressions),
            Self::StaticNeutral => None,
        }
    }

    pub fn all() -> &'static [DeliveryTier] {
        &[
            Self::FullFrames,
            Self::Visemes,
            Self::Expressions,
            Self::StaticNeutral,
        ]
    }
}

impl fmt::Display for DeliveryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Remote backends guarded by independent circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// The speech-synthesis service.
    Synthesis,
    FullFrames,
    Visemes,
    Expressions,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Synthesis => "synthesis",
            Self::FullFrames => "full_frames",
            Self::Visemes => "visemes",
            Self::Expressions => "expressions",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What an asset lookup asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKey {
    Expression(Expression),
    Viseme(Viseme),
    Frame(u32),
}

/// Kind selector for string-keyed lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Expression,
    Viseme,
    Frame,
}

/// Load status of an [`AssetHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Pending,
    Loaded,
    Failed,
}

/// A resolved (or still pending) avatar image.
///
/// Image bytes are reference counted, so cloning a handle is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetHandle {
    /// Source URL the image was (or will be) loaded from.
    pub url: String,
    /// Tier the URL belongs to.
    pub tier: DeliveryTier,
    pub status: LoadStatus,
    /// Encoded image bytes. Empty unless `status` is `Loaded` from a remote
    /// fetch; local static assets are painted from `url` by the renderer.
    pub image: Bytes,
}

impl AssetHandle {
    pub fn loaded(url: impl Into<String>, tier: DeliveryTier, image: Bytes) -> Self {
        Self {
            url: url.into(),
            tier,
            status: LoadStatus::Loaded,
            image,
        }
    }

    /// Placeholder handed to the renderer while a fetch is outstanding.
    pub fn pending(url: impl Into<String>, tier: DeliveryTier) -> Self {
        Self {
            url: url.into(),
            tier,
            status: LoadStatus::Pending,
            image: Bytes::new(),
        }
    }

    pub fn failed(url: impl Into<String>, tier: DeliveryTier) -> Self {
        Self {
            url: url.into(),
            tier,
            status: LoadStatus::Failed,
            image: Bytes::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.status == LoadStatus::Loaded
    }
}
