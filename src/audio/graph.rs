//! The playback graph: source → analyser → destination.
//!
//! The graph is assembled in one step from an analyser size and a
//! destination, so there is no state in which the analyser exists without
//! being connected to an output.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::audio::analyser::Analyser;
use crate::audio::decode::{pcm16_spec, to_pcm16};
use crate::error::{PlayerError, Result};

/// Where rendered samples end up.
pub trait AudioDestination: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Accept one quantum of mono samples.
    fn write(&mut self, samples: &[f32], sample_rate: u32) -> Result<()>;

    /// Called when an utterance has been fully rendered.
    fn end_utterance(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Discards audio. Used by the headless renderer and in tests.
#[derive(Debug, Default)]
pub struct NullDestination {
    samples_written: u64,
}

impl NullDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }
}

impl AudioDestination for NullDestination {
    fn name(&self) -> &str {
        "null"
    }

    fn write(&mut self, samples: &[f32], _sample_rate: u32) -> Result<()> {
        self.samples_written += samples.len() as u64;
        Ok(())
    }
}

/// Appends everything played to a 16-bit mono WAV file.
///
/// The file is created on the first write, at that utterance's sample rate,
/// and finalized when the destination is dropped or [`Self::finish`] is
/// called. Later utterances at a different rate are rejected.
pub struct WavFileDestination {
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    sample_rate: Option<u32>,
}

impl std::fmt::Debug for WavFileDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavFileDestination")
            .field("path", &self.path)
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

impl WavFileDestination {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            sample_rate: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finalize the WAV header.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Audio`] if the header cannot be written.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| PlayerError::Audio(format!("failed to finalize wav: {e}")))?;
        }
        Ok(())
    }
}

impl AudioDestination for WavFileDestination {
    fn name(&self) -> &str {
        "wav"
    }

    fn write(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        match self.sample_rate {
            Some(rate) if rate != sample_rate => {
                return Err(PlayerError::Audio(format!(
                    "{} is {rate} Hz, cannot append {sample_rate} Hz audio",
                    self.path.display()
                )));
            }
            Some(_) => {}
            None => {
                if let Some(parent) = self.path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                let writer = hound::WavWriter::create(&self.path, pcm16_spec(sample_rate))
                    .map_err(|e| {
                        PlayerError::Audio(format!("cannot create {}: {e}", self.path.display()))
                    })?;
                self.writer = Some(writer);
                self.sample_rate = Some(sample_rate);
            }
        }
        if let Some(writer) = self.writer.as_mut() {
            for &s in samples {
                writer
                    .write_sample(to_pcm16(s))
                    .map_err(|e| PlayerError::Audio(format!("failed to write wav sample: {e}")))?;
            }
        }
        Ok(())
    }

    fn end_utterance(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|e| PlayerError::Audio(format!("failed to flush wav: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for WavFileDestination {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!(path = %self.path.display(), error = %e, "wav output not finalized");
        }
    }
}

/// The single audio graph owned by a playback binder.
pub struct AudioGraph {
    analyser: Analyser,
    destination: Box<dyn AudioDestination>,
}

impl std::fmt::Debug for AudioGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioGraph")
            .field("analyser", &self.analyser)
            .field("destination", &self.destination.name())
            .finish()
    }
}

impl AudioGraph {
    /// Build the graph with its analyser wired to `destination`.
    pub fn connect(fft_size: usize, destination: Box<dyn AudioDestination>) -> Self {
        Self {
            analyser: Analyser::new(fft_size),
            destination,
        }
    }

    /// Graph that plays into [`NullDestination`].
    pub fn headless(fft_size: usize) -> Self {
        Self::connect(fft_size, Box::new(NullDestination::new()))
    }

    /// Push one quantum through the analyser to the destination.
    ///
    /// # Errors
    ///
    /// Propagates destination write errors.
    pub fn render(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        self.analyser.push(samples);
        self.destination.write(samples, sample_rate)
    }

    /// Mark the end of an utterance and silence the analyser.
    ///
    /// # Errors
    ///
    /// Propagates destination errors.
    pub fn end_utterance(&mut self) -> Result<()> {
        self.analyser.reset();
        self.destination.end_utterance()
    }

    pub fn analyser(&self) -> &Analyser {
        &self.analyser
    }

    pub fn destination_name(&self) -> &str {
        self.destination.name()
    }
}
