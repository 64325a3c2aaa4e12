//! Canonical URL scheme for avatar assets.
//!
//! The locator is a pure function of [`CdnConfig`]. It never fails: keys it
//! cannot place resolve to the avatar's neutral default, and a key whose
//! fidelity is above the requested tier is downgraded to what that tier can
//! serve.
//!
//! | Tier            | URL                                                          |
//! |-----------------|--------------------------------------------------------------|
//! | full frames     | `{cdn}/{avatar}/frames/{avatar}_frame_{NNNN}.{frame_format}` |
//! | visemes         | `{cdn}/{avatar}/visemes/{VISEME}.{image_format}`             |
//! | expressions     | `{cdn}/{avatar}/{expression template}`                       |
//! | static neutral  | `{local}/{avatar}/base-states/{avatar}_neutral_default.png`  |

use std::sync::Arc;

use crate::config::CdnConfig;
use crate::types::{AssetKey, AssetKind, AvatarId, DeliveryTier, Expression, Viseme};

/// Relative path template of an expression inside an avatar's namespace.
fn expression_template(expression: Expression) -> &'static str {
    match expression {
        Expression::Neutral => "base-states/{avatar}_neutral_default.png",
        Expression::TeachingExplaining => "lesson-sequence/{avatar}_teaching_explaining.png",
        Expression::QuestionCurious => "lesson-sequence/{avatar}_question_curious.png",
        Expression::ConcernedThinking => "emotional-expressions/{avatar}_concerned_thinking.png",
        Expression::HappyCelebrating => "emotional-expressions/{avatar}_happy_celebrating.png",
        Expression::WelcomingEngaging => "expressions/{avatar}_welcoming_768.png",
        Expression::ExcitedCelebrating => "expressions/{avatar}_excited_768.png",
    }
}

/// Maps `(avatar, key, tier)` to a URL.
#[derive(Debug, Clone)]
pub struct AssetLocator {
    config: Arc<CdnConfig>,
}

impl AssetLocator {
    pub fn new(config: Arc<CdnConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CdnConfig {
        &self.config
    }

    /// Resolve a typed key under `tier`.
    pub fn resolve(&self, avatar: AvatarId, key: AssetKey, tier: DeliveryTier) -> String {
        match (tier, self.downgrade(avatar, key, tier)) {
            (DeliveryTier::StaticNeutral, _) => self.static_neutral_url(avatar),
            (_, AssetKey::Frame(index)) => self.frame_url(avatar, index),
            (_, AssetKey::Viseme(viseme)) => self.viseme_url(avatar, viseme),
            (_, AssetKey::Expression(expression)) => self.expression_url(avatar, expression),
        }
    }

    /// Resolve string identifiers, normalising case first.
    ///
    /// Unknown avatars resolve as Kelly; unknown expressions, visemes and
    /// out-of-range or unparseable frame indices resolve to the neutral
    /// default for the tier (REST for visemes).
    pub fn resolve_str(
        &self,
        avatar: &str,
        kind: AssetKind,
        key: &str,
        tier: DeliveryTier,
    ) -> String {
        let avatar = AvatarId::normalise(avatar);
        let key = match kind {
            AssetKind::Expression => {
                AssetKey::Expression(key.parse().unwrap_or(Expression::Neutral))
            }
            AssetKind::Viseme => AssetKey::Viseme(Viseme::from_name(key).unwrap_or(Viseme::Rest)),
            AssetKind::Frame => match key.trim().parse::<u32>() {
                Ok(index) => AssetKey::Frame(index),
                Err(_) => AssetKey::Expression(Expression::Neutral),
            },
        };
        self.resolve(avatar, key, tier)
    }

    /// The key actually served at `tier` for a request of `key`.
    pub fn downgrade(&self, avatar: AvatarId, key: AssetKey, tier: DeliveryTier) -> AssetKey {
        let neutral = AssetKey::Expression(Expression::Neutral);
        match (tier, key) {
            (DeliveryTier::StaticNeutral, _) => neutral,
            (_, AssetKey::Frame(index)) if index >= self.config.avatar(avatar).total_frames => {
                neutral
            }
            (DeliveryTier::FullFrames, key) => key,
            (DeliveryTier::Visemes, AssetKey::Frame(_)) => AssetKey::Viseme(Viseme::Rest),
            (DeliveryTier::Visemes, key) => key,
            (DeliveryTier::Expressions, AssetKey::Expression(e)) => AssetKey::Expression(e),
            (DeliveryTier::Expressions, _) => neutral,
        }
    }

    pub fn frame_url(&self, avatar: AvatarId, index: u32) -> String {
        format!(
            "{}/{avatar}/frames/{avatar}_frame_{index:04}.{}",
            self.cdn_base(),
            self.config.frame_format
        )
    }

    pub fn viseme_url(&self, avatar: AvatarId, viseme: Viseme) -> String {
        format!(
            "{}/{avatar}/visemes/{viseme}.{}",
            self.cdn_base(),
            self.config.image_format
        )
    }

    pub fn expression_url(&self, avatar: AvatarId, expression: Expression) -> String {
        let rel = expression_template(expression).replace("{avatar}", avatar.as_str());
        format!("{}/{avatar}/{rel}", self.cdn_base())
    }

    /// The bundled neutral image. Always served by the local static server.
    pub fn static_neutral_url(&self, avatar: AvatarId) -> String {
        let rel = expression_template(Expression::Neutral).replace("{avatar}", avatar.as_str());
        format!(
            "{}/{avatar}/{rel}",
            self.config.local_base_url.trim_end_matches('/')
        )
    }

    /// CDN health endpoint probed before promoting a session's tier.
    pub fn health_url(&self) -> String {
        format!("{}/health", self.cdn_base())
    }

    fn cdn_base(&self) -> &str {
        self.config.cdn_base_url.trim_end_matches('/')
    }
}
