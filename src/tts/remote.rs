//! HTTP client for the synthesis service.
//!
//! `POST {base}/api/tts` with `{ text, speaker, include_phonemes }` answers
//! `{ audio, audio_format, duration, speaker, text, engine, phonemes }`,
//! where `audio` is a base64 WAV and phoneme times are in seconds.
//! `GET {base}/health` reports liveness and the available voices.
//!
//! Calls go through the same retry loop and circuit breaker as the avatar
//! CDN, under [`Backend::Synthesis`]. Server errors and timeouts are
//! retried; a 4xx answer is final.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use avatar_cdn::{AvatarId, Backend, DeliveryError, RetryPolicy, SharedBreaker, retry_guarded};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::decode_base64_wav;
use crate::config::{CacheConfig, SynthesisConfig};
use crate::error::{PlayerError, Result};
use crate::tts::cache::{SynthesisCache, SynthesisKey};
use crate::tts::{SpeechSynthesizer, Synthesis, SynthesisHealth};
use crate::viseme::PhonemeTiming;

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    speaker: &'a str,
    include_phonemes: bool,
}

#[derive(Debug, Deserialize)]
struct TtsResponse {
    audio: String,
    #[serde(default)]
    audio_format: Option<String>,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    engine: Option<String>,
    #[serde(default)]
    phonemes: Vec<PhonemeTiming>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    detail: serde_json::Value,
}

/// Client for the remote synthesis service.
#[derive(Debug, Clone)]
pub struct RemoteSynthesizer {
    client: reqwest::Client,
    base_url: String,
    include_phonemes: bool,
    retry: RetryPolicy,
    breaker: SharedBreaker,
    cache: Option<SynthesisCache>,
}

impl RemoteSynthesizer {
    /// Build a client. `breaker` is shared with asset delivery so the
    /// player reports one set of circuits.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Config`] if the HTTP client cannot be built.
    pub fn new(
        config: &SynthesisConfig,
        cache: &CacheConfig,
        breaker: SharedBreaker,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(avatar_cdn::http::USER_AGENT)
            .build()
            .map_err(|e| PlayerError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            include_phonemes: config.include_phonemes,
            retry: config.retry.clone(),
            breaker,
            cache: cache.enabled.then(|| SynthesisCache::new(cache)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn cache(&self) -> Option<&SynthesisCache> {
        self.cache.as_ref()
    }

    async fn request(&self, text: &str, speaker: AvatarId) -> avatar_cdn::Result<TtsResponse> {
        let url = format!("{}/api/tts", self.base_url);
        let body = TtsRequest {
            text,
            speaker: speaker.as_str(),
            include_phonemes: self.include_phonemes,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::NetworkTransient(format!("synthesis timed out: {e}"))
                } else {
                    DeliveryError::NetworkTransient(format!("synthesis request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<ErrorBody>()
                .await
                .map(|b| match b.detail {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or_default();
            return Err(classify(status, &detail));
        }

        response
            .json::<TtsResponse>()
            .await
            .map_err(|e| DeliveryError::Parse(format!("invalid synthesis response: {e}")))
    }

    async fn synthesize_uncached(
        &self,
        text: &str,
        speaker: AvatarId,
        cancel: &CancellationToken,
    ) -> Result<Synthesis> {
        let response = retry_guarded(Backend::Synthesis, &self.retry, &self.breaker, cancel, |_| {
            self.request(text, speaker)
        })
        .await
        .map_err(|e| match e {
            DeliveryError::Cancelled => PlayerError::Interrupted,
            other => PlayerError::SynthesisUnavailable(other.to_string()),
        })?;

        if let Some(format) = response.audio_format.as_deref()
            && !format.eq_ignore_ascii_case("wav")
        {
            return Err(PlayerError::Decode(format!(
                "unsupported audio format '{format}'"
            )));
        }
        let audio = decode_base64_wav(&response.audio)?;
        Ok(Synthesis {
            text: text.to_owned(),
            speaker,
            audio,
            duration_secs: response.duration,
            phonemes: response.phonemes,
            engine: response.engine,
        })
    }
}

fn classify(status: StatusCode, detail: &str) -> DeliveryError {
    let message = if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {detail}")
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        DeliveryError::NetworkTransient(message)
    } else {
        DeliveryError::Rejected(message)
    }
}

#[async_trait]
impl SpeechSynthesizer for RemoteSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        speaker: AvatarId,
        cancel: &CancellationToken,
    ) -> Result<Arc<Synthesis>> {
        let text = text.trim();
        let key = SynthesisKey::new(speaker, text);
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&key).await
        {
            debug!(%speaker, chars = text.len(), "synthesis cache hit");
            return Ok(hit);
        }

        let synthesis = Arc::new(self.synthesize_uncached(text, speaker, cancel).await?);
        info!(
            %speaker,
            chars = text.len(),
            duration_ms = synthesis.duration_ms(),
            phonemes = synthesis.phonemes.len(),
            "line synthesized"
        );
        if let Some(cache) = &self.cache {
            cache.insert(key, Arc::clone(&synthesis)).await;
        }
        Ok(synthesis)
    }

    async fn health(&self) -> Result<SynthesisHealth> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PlayerError::SynthesisUnavailable(format!("health check failed: {e}")))?;
        if !response.status().is_success() {
            return Err(PlayerError::SynthesisUnavailable(format!(
                "health check returned HTTP {}",
                response.status()
            )));
        }
        response
            .json::<SynthesisHealth>()
            .await
            .map_err(|e| PlayerError::Decode(format!("invalid health response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
    }

    #[test]
    fn client_errors_are_final() {
        let err = classify(StatusCode::UNPROCESSABLE_ENTITY, "Speaker 'bob' not supported");
        assert!(matches!(err, DeliveryError::Rejected(ref m) if m.contains("bob")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn request_body_shape() {
        let body = TtsRequest {
            text: "Hello",
            speaker: "ken",
            include_phonemes: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"text": "Hello", "speaker": "ken", "include_phonemes": true})
        );
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let config = SynthesisConfig {
            base_url: "http://localhost:5002/".into(),
            ..SynthesisConfig::default()
        };
        let client =
            RemoteSynthesizer::new(&config, &CacheConfig::default(), SharedBreaker::default())
                .unwrap();
        assert_eq!(client.base_url(), "http://localhost:5002");
        assert!(client.cache().is_some());
    }
}
