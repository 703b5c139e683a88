//! Onset-strength envelope and onset picking.
//!
//! The envelope is a mel-band spectral flux: log-power mel spectrogram,
//! first difference along time, half-wave rectified, averaged across bands.
//! It is shared by the onset picker and the beat tracker.

use rustfft::FftPlanner;

use super::spectrum::{apply_filterbank, mel_filterbank, power_to_db, Stft};
use crate::config::AnalysisConfig;

/// Dynamic range kept by the log-power spectrogram.
const TOP_DB: f32 = 80.0;

/// Per-frame onset strength on the onset hop grid.
#[derive(Debug, Clone, PartialEq)]
pub struct OnsetEnvelope {
    pub values: Vec<f32>,
    pub hop: usize,
    pub sample_rate: u32,
}

impl OnsetEnvelope {
    pub fn frame_time(&self, frame: usize) -> f32 {
        frame as f32 * self.hop as f32 / self.sample_rate as f32
    }

    pub fn frames_per_second(&self) -> f32 {
        self.sample_rate as f32 / self.hop as f32
    }

    /// True when the envelope carries no onset energy at all.
    pub fn is_flat(&self) -> bool {
        !self.values.iter().any(|&v| v > 0.0)
    }
}

/// Peak-picking windows in frames (inclusive on both sides of the candidate).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakPicking {
    pub pre_max: usize,
    pub post_max: usize,
    pub pre_avg: usize,
    pub post_avg: usize,
    pub wait: usize,
    pub delta: f32,
}

impl PeakPicking {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            // A zero-width max window would accept every frame; keep picks local maxima.
            pre_max: config.secs_to_onset_frames(config.pre_max).max(1),
            post_max: config.secs_to_onset_frames(config.post_max).max(1),
            pre_avg: config.secs_to_onset_frames(config.pre_avg),
            post_avg: config.secs_to_onset_frames(config.post_avg),
            wait: config.secs_to_onset_frames(config.wait).max(1),
            delta: config.delta,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OnsetDetector {
    stft: Stft,
    mel_bank: Vec<Vec<f32>>,
    sample_rate: u32,
    picking: PeakPicking,
}

impl OnsetDetector {
    pub fn new(planner: &mut FftPlanner<f32>, config: &AnalysisConfig) -> Self {
        Self {
            stft: Stft::new(planner, config.onset_n_fft, config.onset_hop),
            mel_bank: mel_filterbank(
                config.sample_rate,
                config.onset_n_fft,
                config.n_mels,
                0.0,
                config.sample_rate as f32 / 2.0,
            ),
            sample_rate: config.sample_rate,
            picking: PeakPicking::from_config(config),
        }
    }

    /// Compute the onset-strength envelope of `samples`.
    pub fn strength(&self, samples: &[f32]) -> OnsetEnvelope {
        let mut mel: Vec<Vec<f32>> = self
            .stft
            .power(samples)
            .iter()
            .map(|frame| apply_filterbank(&self.mel_bank, frame))
            .collect();
        power_to_db(&mut mel, TOP_DB);

        let n_frames = mel.len();
        let flux = mel.windows(2).map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);
            let rectified: f32 = cur.iter().zip(prev).map(|(c, p)| (c - p).max(0.0)).sum();
            rectified / cur.len().max(1) as f32
        });

        // Shift right by the lag plus half a frame to undo the centering delay,
        // then trim back to the spectrogram length.
        let shift = 1 + self.stft.n_fft() / (2 * self.stft.hop());
        let mut values: Vec<f32> = std::iter::repeat_n(0.0, shift).chain(flux).collect();
        values.resize(n_frames, 0.0);

        OnsetEnvelope {
            values,
            hop: self.stft.hop(),
            sample_rate: self.sample_rate,
        }
    }

    /// Onset times in seconds, strictly increasing. Empty for a flat envelope.
    pub fn detect(&self, envelope: &OnsetEnvelope) -> Vec<f32> {
        let frames = pick_peaks(&envelope.values, &self.picking);
        log::debug!("Picked {} onsets from {} frames", frames.len(), envelope.values.len());
        frames.into_iter().map(|f| envelope.frame_time(f)).collect()
    }
}

/// Pick peaks of an envelope after min/max normalization.
///
/// A frame `n` is a peak when it is the maximum of `[n - pre_max, n + post_max]`,
/// exceeds the mean of `[n - pre_avg, n + post_avg]` by `delta`, and lies more
/// than `wait` frames after the previous peak.
pub fn pick_peaks(values: &[f32], p: &PeakPicking) -> Vec<usize> {
    if values.is_empty() {
        return Vec::new();
    }
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max <= min || !values.iter().any(|&v| v > 0.0) {
        return Vec::new();
    }
    let x: Vec<f32> = values.iter().map(|v| (v - min) / (max - min)).collect();
    let n = x.len();

    let mut peaks = Vec::new();
    let mut last: Option<usize> = None;
    for i in 0..n {
        let max_window = &x[i.saturating_sub(p.pre_max)..(i + p.post_max + 1).min(n)];
        if max_window.iter().any(|&v| v > x[i]) {
            continue;
        }
        let avg_window = &x[i.saturating_sub(p.pre_avg)..(i + p.post_avg + 1).min(n)];
        let mean = avg_window.iter().sum::<f32>() / avg_window.len() as f32;
        if x[i] < mean + p.delta {
            continue;
        }
        if let Some(prev) = last {
            if i <= prev + p.wait {
                continue;
            }
        }
        peaks.push(i);
        last = Some(i);
    }
    peaks
}
