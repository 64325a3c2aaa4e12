//! Pre-flight text filter.
//!
//! Lesson scripts sometimes still carry authoring placeholders. Voicing them
//! would be worse than silence, so they are caught before any request goes
//! out.

use crate::config::PreflightConfig;
use crate::error::{PlayerError, Result};

#[derive(Debug, Clone)]
pub struct PreflightFilter {
    enabled: bool,
    phrases: Vec<String>,
    markers: Vec<String>,
}

impl Default for PreflightFilter {
    fn default() -> Self {
        Self::new(&PreflightConfig::default())
    }
}

impl PreflightFilter {
    pub fn new(config: &PreflightConfig) -> Self {
        let normalise = |list: &[String]| -> Vec<String> {
            list.iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        };
        Self {
            enabled: config.enabled,
            phrases: normalise(&config.blocked_phrases),
            markers: normalise(&config.blocked_markers),
        }
    }

    /// Why `text` must not be voiced, if it must not.
    ///
    /// Empty text is always blocked, even with the filter disabled.
    pub fn block_reason(&self, text: &str) -> Option<String> {
        let normalised = text.trim().to_lowercase();
        if normalised.is_empty() {
            return Some("empty text".into());
        }
        if !self.enabled {
            return None;
        }
        if self.phrases.iter().any(|p| *p == normalised) {
            return Some(format!("placeholder phrase '{normalised}'"));
        }
        self.markers
            .iter()
            .find(|m| normalised.contains(m.as_str()))
            .map(|m| format!("contains marker '{m}'"))
    }

    pub fn is_blocked(&self, text: &str) -> bool {
        self.block_reason(text).is_some()
    }

    /// Pass `text` through, or fail with [`PlayerError::Blocked`].
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Blocked`] for placeholder text.
    pub fn check<'a>(&self, text: &'a str) -> Result<&'a str> {
        match self.block_reason(text) {
            Some(reason) => {
                tracing::warn!(%reason, "blocked text before synthesis");
                Err(PlayerError::Blocked(reason))
            }
            None => Ok(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_phrases_are_blocked_case_insensitively() {
        let filter = PreflightFilter::default();
        for text in [
            "Lesson Orientation",
            "  vitamin cue ",
            "TIMING HABIT",
            "cloudy/indoor fixes",
            "Close + Plan",
            "test audio",
        ] {
            assert!(filter.is_blocked(text), "{text}");
        }
    }

    #[test]
    fn markers_block_anywhere() {
        let filter = PreflightFilter::default();
        assert!(filter.is_blocked("Insert PLACEHOLDER copy here"));
        assert!(filter.is_blocked("see script_text field"));
    }

    #[test]
    fn phrases_only_block_whole_lines() {
        let filter = PreflightFilter::default();
        assert!(!filter.is_blocked("Today's lesson orientation covers sunlight."));
        assert!(!filter.is_blocked("Run the test audio check later, okay?"));
    }

    #[test]
    fn empty_text_is_blocked() {
        let filter = PreflightFilter::default();
        assert!(filter.is_blocked(""));
        assert!(filter.is_blocked("   \n"));
    }

    #[test]
    fn real_lines_pass() {
        let filter = PreflightFilter::default();
        assert_eq!(
            filter.check("Welcome to today's lesson.").unwrap(),
            "Welcome to today's lesson."
        );
    }

    #[test]
    fn disabled_filter_still_blocks_empty() {
        let filter = PreflightFilter::new(&PreflightConfig {
            enabled: false,
            ..PreflightConfig::default()
        });
        assert!(!filter.is_blocked("placeholder"));
        assert!(filter.is_blocked(""));
    }

    #[test]
    fn check_reports_reason() {
        let err = PreflightFilter::default().check("vitamin cue").unwrap_err();
        assert!(matches!(err, PlayerError::Blocked(ref r) if r.contains("vitamin cue")));
    }
}
