//! WAV decoding and encoding.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{PlayerError, Result};

/// Mono f32 audio ready for the playback graph.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Length of the audio in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / u64::from(self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decode an in-memory WAV file, mixing multi-channel audio down to mono.
///
/// # Errors
///
/// Returns [`PlayerError::Decode`] if the bytes are not a readable WAV.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PlayerError::Decode(format!("invalid WAV: {e}")))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(PlayerError::Decode("WAV header has no samples".into()));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map_err(|e| PlayerError::Decode(format!("WAV read error: {e}")))
                        .map(|v| v as f32 / max)
                })
                .collect::<Result<Vec<f32>>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(|e| PlayerError::Decode(format!("WAV read error: {e}"))))
            .collect::<Result<Vec<f32>>>()?,
    };

    let samples = if spec.channels > 1 {
        let ch = spec.channels as usize;
        samples
            .chunks(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    } else {
        samples
    };
    Ok(DecodedAudio::new(samples, spec.sample_rate))
}

/// Decode the base64 WAV payload returned by the synthesis service.
///
/// # Errors
///
/// Returns [`PlayerError::Decode`] if the payload is not base64 or not a WAV.
pub fn decode_base64_wav(encoded: &str) -> Result<DecodedAudio> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| PlayerError::Decode(format!("invalid base64 audio: {e}")))?;
    decode_wav(&bytes)
}

/// Encode mono samples as a 16-bit PCM WAV in memory.
///
/// # Errors
///
/// Returns [`PlayerError::Audio`] if encoding fails.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, pcm16_spec(sample_rate))
            .map_err(|e| PlayerError::Audio(format!("failed to create wav writer: {e}")))?;
        for &s in samples {
            writer
                .write_sample(to_pcm16(s))
                .map_err(|e| PlayerError::Audio(format!("failed to write wav sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| PlayerError::Audio(format!("failed to finalize wav: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Write mono samples to a 16-bit PCM WAV file.
///
/// # Errors
///
/// Returns [`PlayerError::Audio`] if the file cannot be written.
pub fn write_wav(path: &Path, audio: &DecodedAudio) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, pcm16_spec(audio.sample_rate))
        .map_err(|e| PlayerError::Audio(format!("cannot create {}: {e}", path.display())))?;
    for &s in audio.samples.iter() {
        writer
            .write_sample(to_pcm16(s))
            .map_err(|e| PlayerError::Audio(format!("failed to write wav sample: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| PlayerError::Audio(format!("failed to finalize wav: {e}")))
}

pub(crate) fn pcm16_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

pub(crate) fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn tone(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect()
    }

    #[test]
    fn encoded_wav_decodes_to_same_length() {
        let bytes = encode_wav(&tone(2205), 22050).unwrap();
        let audio = decode_wav(&bytes).unwrap();
        assert_eq!(audio.sample_rate, 22050);
        assert_eq!(audio.samples.len(), 2205);
        assert_eq!(audio.duration_ms(), 100);
    }

    #[test]
    fn base64_payload_decodes() {
        let bytes = encode_wav(&tone(441), 44100).unwrap();
        let encoded = BASE64.encode(&bytes);
        let audio = decode_base64_wav(&encoded).unwrap();
        assert_eq!(audio.duration_ms(), 10);
    }

    #[test]
    fn stereo_is_mixed_to_mono() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..80 {
                writer.write_sample(i16::MAX).unwrap();
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        let audio = decode_wav(cursor.get_ref()).unwrap();
        assert_eq!(audio.samples.len(), 80);
        assert!((audio.samples[0] - 0.5).abs() < 0.01);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(decode_wav(b"not a wav"), Err(PlayerError::Decode(_))));
        assert!(matches!(
            decode_base64_wav("%%%"),
            Err(PlayerError::Decode(_))
        ));
    }

    #[test]
    fn write_wav_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        write_wav(&path, &DecodedAudio::new(tone(800), 8000)).unwrap();
        let audio = decode_wav(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(audio.duration_ms(), 100);
    }
}
