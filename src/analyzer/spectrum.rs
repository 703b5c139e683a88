//! Framing and short-time spectra shared by the onset, beat and key stages.
//!
//! Frames are centered: the signal is zero-padded by `n_fft / 2` on both sides,
//! so frame `t` is centered on sample `t * hop` and a signal of `n` samples
//! yields `1 + n / hop` frames.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Floor used before taking logarithms.
pub const AMIN: f32 = 1e-10;

/// Periodic Hann window of length `n`.
pub fn hann(n: usize) -> Vec<f32> {
    if n == 0 {
        return Vec::new();
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / n as f32).cos())
        .collect()
}

/// Number of centered frames for a signal of `len` samples.
pub fn centered_frame_count(len: usize, hop: usize) -> usize {
    if hop == 0 { 0 } else { 1 + len / hop }
}

/// Copy of `samples` padded with zeros so every centered `frame_len` window fits.
///
/// The left side gets `frame_len / 2` zeros and the right side the rest, so
/// odd frame lengths still leave room for the last frame.
pub fn pad_center(samples: &[f32], frame_len: usize) -> Vec<f32> {
    let left = frame_len / 2;
    let mut padded = vec![0.0f32; samples.len() + frame_len];
    padded[left..left + samples.len()].copy_from_slice(samples);
    padded
}

/// Iterate the centered frames of `samples` (each exactly `frame_len` long).
pub fn centered_frames<'a>(
    padded: &'a [f32],
    frame_len: usize,
    hop: usize,
    count: usize,
) -> impl Iterator<Item = &'a [f32]> + 'a {
    (0..count).map(move |t| {
        let start = t * hop;
        &padded[start..start + frame_len]
    })
}

/// A planned short-time Fourier transform.
///
/// The FFT plan is `Send + Sync`, so one `Stft` can be shared by every
/// worker of a batch.
#[derive(Clone)]
pub struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for Stft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stft")
            .field("n_fft", &self.n_fft)
            .field("hop", &self.hop)
            .finish()
    }
}

impl Stft {
    pub fn new(planner: &mut FftPlanner<f32>, n_fft: usize, hop: usize) -> Self {
        Self {
            n_fft,
            hop,
            window: hann(n_fft),
            fft: planner.plan_fft_forward(n_fft),
        }
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Number of non-negative frequency bins.
    pub fn n_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Center frequency of bin `k` in Hz.
    pub fn bin_frequency(&self, k: usize, sample_rate: u32) -> f32 {
        k as f32 * sample_rate as f32 / self.n_fft as f32
    }

    /// Power spectrogram, one `Vec` of `n_bins` values per centered frame.
    pub fn power(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let n_frames = centered_frame_count(samples.len(), self.hop);
        let padded = pad_center(samples, self.n_fft);
        let n_bins = self.n_bins();
        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];

        centered_frames(&padded, self.n_fft, self.hop, n_frames)
            .map(|frame| {
                for ((slot, &s), &w) in buffer.iter_mut().zip(frame).zip(&self.window) {
                    *slot = Complex::new(s * w, 0.0);
                }
                self.fft.process_with_scratch(&mut buffer, &mut scratch);
                buffer[..n_bins].iter().map(|c| c.norm_sqr()).collect()
            })
            .collect()
    }
}

fn hz_to_mel(hz: f32) -> f32 {
    // Slaney scale: linear below 1 kHz, logarithmic above.
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f32).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f32).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        f_sp * mel
    }
}

/// Triangular mel filterbank (`n_mels × n_bins`), area-normalized.
pub fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize, fmin: f32, fmax: f32) -> Vec<Vec<f32>> {
    let n_bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f32> = (0..n_bins)
        .map(|k| k as f32 * sample_rate as f32 / n_fft as f32)
        .collect();

    let (mel_min, mel_max) = (hz_to_mel(fmin), hz_to_mel(fmax));
    let mel_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (lo, center, hi) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
            let norm = 2.0 / (hi - lo).max(AMIN);
            fft_freqs
                .iter()
                .map(|&f| {
                    let lower = (f - lo) / (center - lo).max(AMIN);
                    let upper = (hi - f) / (hi - center).max(AMIN);
                    lower.min(upper).max(0.0) * norm
                })
                .collect()
        })
        .collect()
}

/// Apply a filterbank to one spectrum frame.
pub fn apply_filterbank(bank: &[Vec<f32>], frame: &[f32]) -> Vec<f32> {
    bank.iter()
        .map(|filter| filter.iter().zip(frame).map(|(w, p)| w * p).sum())
        .collect()
}

/// Convert a power spectrogram to decibels in place (reference 1.0),
/// flooring everything more than `top_db` below the loudest cell.
pub fn power_to_db(spec: &mut [Vec<f32>], top_db: f32) {
    let mut max_db = f32::NEG_INFINITY;
    for frame in spec.iter_mut() {
        for v in frame.iter_mut() {
            *v = 10.0 * v.max(AMIN).log10();
            max_db = max_db.max(*v);
        }
    }
    let floor = max_db - top_db;
    for frame in spec.iter_mut() {
        for v in frame.iter_mut() {
            *v = v.max(floor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_hann_is_periodic() {
        let w = hann(8);
        assert_abs_diff_eq!(w[0], 0.0);
        assert_abs_diff_eq!(w[4], 1.0, epsilon = 1e-6);
        // Periodic: w[1] == w[7]
        assert_abs_diff_eq!(w[1], w[7], epsilon = 1e-6);
    }

    #[test]
    fn test_centered_frame_count() {
        assert_eq!(centered_frame_count(16_000, 320), 51);
        assert_eq!(centered_frame_count(0, 512), 1);
        assert_eq!(centered_frame_count(100, 0), 0);
    }

    #[test]
    fn test_odd_frame_length_fits_last_frame() {
        let samples: Vec<f32> = (1..=100).map(|i| i as f32).collect();
        let padded = pad_center(&samples, 7);
        assert_eq!(padded.len(), 107);
        // Frame t is centered on sample t * hop
        assert_eq!(padded[3], 1.0);
        let frames: Vec<_> = centered_frames(&padded, 7, 10, centered_frame_count(100, 10)).collect();
        assert_eq!(frames.len(), 11);
        assert!(frames.iter().all(|f| f.len() == 7));
        assert_eq!(frames[10][3], 0.0);
    }

    #[test]
    fn test_power_peaks_at_tone_bin() {
        let sr = 16_000;
        let n_fft = 1024;
        let mut planner = FftPlanner::new();
        let stft = Stft::new(&mut planner, n_fft, 256);
        // 1 kHz falls exactly on bin 64
        let tone: Vec<f32> = (0..sr)
            .map(|i| (2.0 * PI * 1000.0 * i as f32 / sr as f32).sin())
            .collect();
        let power = stft.power(&tone);
        assert_eq!(power.len(), centered_frame_count(tone.len(), 256));
        let mid = &power[power.len() / 2];
        let peak = mid
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k)
            .unwrap();
        assert_eq!(peak, 64);
        assert_abs_diff_eq!(stft.bin_frequency(peak, sr), 1000.0);
    }

    #[test]
    fn test_mel_roundtrip_and_bank_shape() {
        for hz in [0.0, 440.0, 1000.0, 4000.0] {
            assert_abs_diff_eq!(mel_to_hz(hz_to_mel(hz)), hz, epsilon = 0.05);
        }
        let bank = mel_filterbank(16_000, 2048, 128, 0.0, 8000.0);
        assert_eq!(bank.len(), 128);
        assert_eq!(bank[0].len(), 1025);
        assert!(bank.iter().all(|f| f.iter().all(|w| *w >= 0.0)));
    }

    #[test]
    fn test_power_to_db_floors_at_top_db() {
        let mut spec = vec![vec![1.0, 1e-20], vec![0.0, 0.1]];
        power_to_db(&mut spec, 80.0);
        assert_abs_diff_eq!(spec[0][0], 0.0);
        assert_abs_diff_eq!(spec[0][1], -80.0);
        assert_abs_diff_eq!(spec[1][1], -10.0, epsilon = 1e-4);
    }
}
