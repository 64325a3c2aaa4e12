//! Level and spectrum analysis of the audio passing through the graph.

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

/// Keeps the most recent `fft_size` samples and derives RMS level and a
/// magnitude spectrum from them on demand.
pub struct Analyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    ring: Vec<f32>,
    write_pos: usize,
}

impl std::fmt::Debug for Analyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyser")
            .field("fft_size", &self.ring.len())
            .finish_non_exhaustive()
    }
}

fn hann_window(len: usize) -> Vec<f32> {
    if len < 2 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|n| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * n as f32 / (len - 1) as f32).cos()))
        .collect()
}

impl Analyser {
    /// `fft_size` is rounded up to a power of two (at least 32).
    pub fn new(fft_size: usize) -> Self {
        let size = fft_size.max(32).next_power_of_two();
        let mut planner = FftPlanner::<f32>::new();
        Self {
            fft: planner.plan_fft_forward(size),
            window: hann_window(size),
            ring: vec![0.0; size],
            write_pos: 0,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.ring.len()
    }

    /// Number of bins returned by [`Self::spectrum`].
    pub fn bin_count(&self) -> usize {
        self.ring.len() / 2
    }

    /// Feed samples; older ones fall out of the window.
    pub fn push(&mut self, samples: &[f32]) {
        let size = self.ring.len();
        for &s in samples {
            self.ring[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % size;
        }
    }

    /// Zero the window, e.g. between utterances.
    pub fn reset(&mut self) {
        self.ring.iter_mut().for_each(|s| *s = 0.0);
        self.write_pos = 0;
    }

    /// Samples in chronological order.
    fn ordered(&self) -> impl Iterator<Item = f32> + '_ {
        self.ring[self.write_pos..]
            .iter()
            .chain(&self.ring[..self.write_pos])
            .copied()
    }

    /// Root-mean-square level of the current window.
    pub fn rms(&self) -> f32 {
        let sum: f32 = self.ring.iter().map(|s| s * s).sum();
        (sum / self.ring.len() as f32).sqrt()
    }

    /// Normalised magnitude per bin, DC first, `fft_size / 2` bins.
    pub fn spectrum(&self) -> Vec<f32> {
        let size = self.ring.len();
        let mut buf: Vec<Complex32> = self
            .ordered()
            .zip(&self.window)
            .map(|(s, w)| Complex32::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut buf);
        let scale = 2.0 / size as f32;
        buf[..size / 2].iter().map(|c| c.norm() * scale).collect()
    }

    /// Index of the strongest bin, ignoring DC.
    pub fn peak_bin(&self) -> Option<usize> {
        self.spectrum()
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }
}
