//! Synthesis client tests against a mock service.

use avatar_cdn::{
    AvatarId, Backend, CircuitBreakerConfig, CircuitState, RetryPolicy, SharedBreaker,
};
use base64::Engine as _;
use lesson_avatar::PlayerError;
use lesson_avatar::audio::encode_wav;
use lesson_avatar::config::{CacheConfig, SynthesisConfig};
use lesson_avatar::tts::{RemoteSynthesizer, SpeechSynthesizer};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn wav_base64(ms: usize) -> String {
    let samples: Vec<f32> = (0..16 * ms).map(|i| (i as f32 * 0.05).sin() * 0.4).collect();
    let wav = encode_wav(&samples, 16000).unwrap();
    base64::engine::general_purpose::STANDARD.encode(wav)
}

fn client_for(server: &MockServer, breaker: SharedBreaker) -> RemoteSynthesizer {
    let config = SynthesisConfig {
        base_url: server.uri(),
        timeout_secs: 2,
        retry: RetryPolicy::default().with_base_delay_ms(1),
        ..SynthesisConfig::default()
    };
    RemoteSynthesizer::new(&config, &CacheConfig::default(), breaker).unwrap()
}

fn breaker() -> SharedBreaker {
    SharedBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout_ms: 60_000,
    })
}

fn tts_ok(text: &str, speaker: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "audio": wav_base64(500),
        "audio_format": "wav",
        "duration": 0.5,
        "speaker": speaker,
        "text": text,
        "engine": "piper",
        "phonemes": [
            {"phoneme": "HH", "start": 0.0, "end": 0.1},
            {"phoneme": "EH1", "start": 0.1, "end": 0.2},
            {"phoneme": "L", "start": 0.2, "end": 0.3},
            {"phoneme": "OW1", "start": 0.3, "end": 0.5}
        ]
    }))
}

#[tokio::test]
async fn synthesizes_and_caches_a_line() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/tts"))
        .and(body_json(json!({
            "text": "Hello",
            "speaker": "ken",
            "include_phonemes": true
        })))
        .respond_with(tts_ok("Hello", "ken"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, breaker());
    let cancel = CancellationToken::new();
    let first = client.synthesize("Hello", AvatarId::Ken, &cancel).await.unwrap();
    assert_eq!(first.duration_ms(), 500);
    assert_eq!(first.phonemes.len(), 4);
    assert_eq!(first.engine.as_deref(), Some("piper"));
    assert_eq!(first.audio.sample_rate, 16000);

    // Surrounding whitespace hits the same cache entry; the mock expects one call.
    let second = client.synthesize("  Hello ", AvatarId::Ken, &cancel).await.unwrap();
    assert_eq!(second.text, "Hello");
}

#[tokio::test]
async fn server_errors_retry_then_open_the_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/tts"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let breaker = breaker();
    let client = client_for(&server, breaker.clone());
    let cancel = CancellationToken::new();

    let err = client.synthesize("Hello", AvatarId::Kelly, &cancel).await.unwrap_err();
    assert!(matches!(err, PlayerError::SynthesisUnavailable(_)));
    assert_eq!(breaker.state(Backend::Synthesis), CircuitState::Open);

    // Open circuit: fails fast, no fourth request.
    let err = client.synthesize("Again", AvatarId::Kelly, &cancel).await.unwrap_err();
    assert!(matches!(err, PlayerError::SynthesisUnavailable(ref m) if m.contains("circuit open")));
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/tts"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"detail": "Text is required"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let breaker = breaker();
    let client = client_for(&server, breaker.clone());
    let err = client
        .synthesize("x", AvatarId::Kelly, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PlayerError::SynthesisUnavailable(ref m) if m.contains("Text is required")
    ));
    assert_eq!(breaker.state(Backend::Synthesis), CircuitState::Closed);
}

#[tokio::test]
async fn unsupported_audio_format_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/tts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "audio": "AAAA",
            "audio_format": "mp3",
            "duration": 1.0
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, breaker());
    let err = client
        .synthesize("Hello", AvatarId::Kelly, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PlayerError::Decode(ref m) if m.contains("mp3")));
}

#[tokio::test]
async fn cancelled_synthesis_is_interrupted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/tts"))
        .respond_with(tts_ok("slow", "kelly").set_delay(std::time::Duration::from_secs(1)))
        .mount(&server)
        .await;

    let client = client_for(&server, breaker());
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        canceller.cancel();
    });
    let err = client
        .synthesize("slow", AvatarId::Kelly, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PlayerError::Interrupted));
}

#[tokio::test]
async fn health_reports_voices() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "server": "Piper TTS",
            "status": "healthy",
            "engine": "piper",
            "voices": ["kelly", "ken"]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, breaker());
    let health = client.health().await.unwrap();
    assert!(health.is_healthy());
    assert!(health.has_voice(AvatarId::Ken));
}

#[tokio::test]
async fn unreachable_health_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = client_for(&server, breaker());
    assert!(matches!(
        client.health().await,
        Err(PlayerError::SynthesisUnavailable(_))
    ));
}
