//! Global tempo estimation and dynamic-programming beat tracking.
//!
//! Tempo comes from the onset envelope's autocorrelation, averaged over
//! overlapping windows and weighted by a log-normal prior around `start_bpm`.
//! Beats are then placed by dynamic programming: each frame's cumulative score
//! is its own onset strength plus the best predecessor roughly one beat period
//! earlier, penalized by how far that gap strays from the period.

use super::onset::OnsetEnvelope;
use super::spectrum::hann;
use crate::config::AnalysisConfig;

/// Autocorrelation window for the tempogram (frames, ~12 s at 16 kHz / 512).
const AC_WINDOW: usize = 384;
/// Hop between tempogram windows.
const AC_HOP: usize = AC_WINDOW / 4;
/// Width of the tempo prior in octaves.
const PRIOR_STD_OCTAVES: f32 = 1.0;
/// Smoothing applied to beat strengths before trimming.
const TRIM_KERNEL: [f32; 5] = [0.0, 0.5, 1.0, 0.5, 0.0];

/// Estimated tempo and beat positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeatGrid {
    /// Beats per minute; 0.0 when no tempo could be estimated.
    pub tempo: f32,
    /// Beat times in seconds, strictly increasing.
    pub beats: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct BeatTracker {
    start_bpm: f32,
    tightness: f32,
    min_bpm: f32,
    max_bpm: f32,
}

impl BeatTracker {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            start_bpm: config.start_bpm,
            tightness: config.tightness,
            min_bpm: config.min_bpm,
            max_bpm: config.max_bpm,
        }
    }

    /// Estimate tempo and beats from an onset envelope.
    ///
    /// Silent or too-short input yields `tempo == 0.0` and no beats.
    pub fn track(&self, envelope: &OnsetEnvelope) -> BeatGrid {
        if envelope.is_flat() {
            log::debug!("Flat onset envelope, no beats");
            return BeatGrid::default();
        }

        let Some(tempo) = self.estimate_tempo(envelope) else {
            return BeatGrid::default();
        };

        let frames = self.track_frames(&envelope.values, envelope.frames_per_second(), tempo);
        let beats = frames.into_iter().map(|f| envelope.frame_time(f)).collect::<Vec<_>>();
        log::debug!("Tempo {:.1} BPM, {} beats", tempo, beats.len());
        BeatGrid { tempo, beats }
    }

    /// Tempo in BPM from the prior-weighted mean autocorrelation.
    pub fn estimate_tempo(&self, envelope: &OnsetEnvelope) -> Option<f32> {
        let fps = envelope.frames_per_second();
        let min_lag = ((60.0 * fps / self.max_bpm).floor() as usize).max(1);
        let max_lag = ((60.0 * fps / self.min_bpm).ceil() as usize).min(AC_WINDOW - 1);
        if min_lag + 2 > max_lag {
            return None;
        }

        if envelope.values.len() < 2 * min_lag + 1 {
            log::debug!("Onset envelope too short for tempo estimation");
            return None;
        }

        let ac = windowed_autocorrelation(&envelope.values, max_lag + 1);
        let log_start = self.start_bpm.log2();
        let mut weighted = vec![f32::NEG_INFINITY; max_lag + 1];
        for (lag, slot) in weighted.iter_mut().enumerate().skip(min_lag) {
            let bpm = 60.0 * fps / lag as f32;
            let z = (bpm.log2() - log_start) / PRIOR_STD_OCTAVES;
            *slot = ac[lag] * (-0.5 * z * z).exp();
        }

        let mut best_lag = min_lag;
        for lag in min_lag..=max_lag {
            if weighted[lag] > weighted[best_lag] {
                best_lag = lag;
            }
        }
        let best = weighted[best_lag];
        if best <= 0.0 {
            log::debug!("No periodicity in onset envelope");
            return None;
        }

        // Parabolic interpolation for sub-frame lag precision
        let lag = if best_lag > min_lag && best_lag < max_lag {
            let (prev, next) = (weighted[best_lag - 1], weighted[best_lag + 1]);
            let denom = prev - 2.0 * best + next;
            let offset = if denom.abs() > 1e-10 { 0.5 * (prev - next) / denom } else { 0.0 };
            best_lag as f32 + offset.clamp(-0.5, 0.5)
        } else {
            best_lag as f32
        };

        Some(60.0 * fps / lag)
    }

    /// Beat frame indices for a fixed tempo.
    fn track_frames(&self, onset: &[f32], fps: f32, bpm: f32) -> Vec<usize> {
        let period = ((60.0 * fps / bpm).round() as usize).max(2);

        let std = sample_std(onset);
        if std <= 0.0 {
            return Vec::new();
        }
        let normalized: Vec<f32> = onset.iter().map(|v| v / std).collect();
        let local = local_score(&normalized, period);

        let (backlink, cumscore) = self.dynamic_program(&local, period);
        let Some(tail) = last_beat(&cumscore) else {
            return Vec::new();
        };

        let mut beats = vec![tail];
        let mut cursor = tail;
        while let Some(prev) = backlink[cursor] {
            beats.push(prev);
            cursor = prev;
        }
        beats.reverse();

        trim_beats(&local, beats)
    }

    fn dynamic_program(&self, local: &[f32], period: usize) -> (Vec<Option<usize>>, Vec<f32>) {
        let p = period as f32;
        // Predecessor offsets: from two periods back to half a period back
        let offsets: Vec<usize> = (((p / 2.0).round() as usize).max(1)..=2 * period).rev().collect();
        let txwt: Vec<f32> = offsets
            .iter()
            .map(|&d| -self.tightness * (d as f32 / p).ln().powi(2))
            .collect();

        let local_max = local.iter().copied().fold(0.0f32, f32::max);
        let mut backlink = vec![None; local.len()];
        let mut cumscore = vec![0.0f32; local.len()];
        let mut first_beat = true;

        for (i, &score) in local.iter().enumerate() {
            let mut best = f32::NEG_INFINITY;
            let mut best_j = None;
            for (&d, &w) in offsets.iter().zip(&txwt) {
                let (candidate, j) = match i.checked_sub(d) {
                    Some(j) => (w + cumscore[j], Some(j)),
                    None => (w, None),
                };
                if candidate > best {
                    best = candidate;
                    best_j = j;
                }
            }
            cumscore[i] = score + best;
            if first_beat && score < 0.01 * local_max {
                backlink[i] = None;
            } else {
                backlink[i] = best_j;
                first_beat = false;
            }
        }
        (backlink, cumscore)
    }
}

/// Mean over windows of the mean-removed, lag-0-normalized autocorrelation.
fn windowed_autocorrelation(values: &[f32], n_lags: usize) -> Vec<f32> {
    let window = hann(AC_WINDOW);
    let half = AC_WINDOW / 2;
    let n_windows = values.len().div_ceil(AC_HOP).max(1);
    let mut acc = vec![0.0f32; n_lags];
    let mut used = 0usize;

    for w in 0..n_windows {
        let center = w * AC_HOP;
        let segment: Vec<f32> = (0..AC_WINDOW)
            .map(|k| {
                let idx = (center + k).checked_sub(half);
                idx.and_then(|i| values.get(i)).copied().unwrap_or(0.0) * window[k]
            })
            .collect();
        let mean = segment.iter().sum::<f32>() / AC_WINDOW as f32;
        let centered: Vec<f32> = segment.iter().map(|v| v - mean).collect();
        let energy: f32 = centered.iter().map(|v| v * v).sum();
        if energy < 1e-10 {
            continue;
        }
        for (lag, slot) in acc.iter_mut().enumerate() {
            let corr: f32 = centered[..AC_WINDOW - lag]
                .iter()
                .zip(&centered[lag..])
                .map(|(a, b)| a * b)
                .sum();
            *slot += corr / energy;
        }
        used += 1;
    }

    if used > 0 {
        acc.iter_mut().for_each(|v| *v /= used as f32);
    }
    acc
}

fn sample_std(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (values.len() - 1) as f32;
    var.sqrt()
}

/// Onset strength smoothed by a Gaussian one period wide.
fn local_score(onset: &[f32], period: usize) -> Vec<f32> {
    let p = period as f32;
    let kernel: Vec<f32> = (-(period as i64)..=period as i64)
        .map(|k| (-0.5 * (k as f32 * 32.0 / p).powi(2)).exp())
        .collect();
    convolve_same(onset, &kernel)
}

/// Full convolution cropped to the input length, centered.
fn convolve_same(x: &[f32], kernel: &[f32]) -> Vec<f32> {
    let (n, m) = (x.len(), kernel.len());
    if n == 0 || m == 0 {
        return vec![0.0; n];
    }
    let offset = (m - 1) / 2;
    (0..n)
        .map(|out| {
            let full = out + offset;
            (0..m)
                .filter_map(|k| full.checked_sub(k).and_then(|i| x.get(i)).map(|v| v * kernel[k]))
                .sum()
        })
        .collect()
}

/// Last frame whose cumulative score is a local max above half the median local max.
fn last_beat(cumscore: &[f32]) -> Option<usize> {
    let n = cumscore.len();
    let is_max = |i: usize| {
        let left = if i == 0 { cumscore[0] } else { cumscore[i - 1] };
        let right = if i + 1 == n { cumscore[i] } else { cumscore[i + 1] };
        cumscore[i] > left && cumscore[i] >= right
    };
    let mut maxima: Vec<f32> = (0..n).filter(|&i| is_max(i)).map(|i| cumscore[i]).collect();
    if maxima.is_empty() {
        return n.checked_sub(1);
    }
    maxima.sort_by(|a, b| a.total_cmp(b));
    let median = if maxima.len() % 2 == 0 {
        0.5 * (maxima[maxima.len() / 2 - 1] + maxima[maxima.len() / 2])
    } else {
        maxima[maxima.len() / 2]
    };
    (0..n).rev().find(|&i| is_max(i) && 2.0 * cumscore[i] > median)
}

/// Drop weak leading and trailing beats.
fn trim_beats(local: &[f32], beats: Vec<usize>) -> Vec<usize> {
    if beats.is_empty() {
        return beats;
    }
    let at_beats: Vec<f32> = beats.iter().map(|&b| local[b]).collect();
    let smooth = convolve_same(&at_beats, &TRIM_KERNEL);
    let rms = (smooth.iter().map(|v| v * v).sum::<f32>() / smooth.len() as f32).sqrt();
    let threshold = 0.5 * rms;

    let first = smooth.iter().position(|&v| v > threshold);
    let last = smooth.iter().rposition(|&v| v > threshold);
    match (first, last) {
        (Some(a), Some(b)) => beats[a..=b].to_vec(),
        _ => Vec::new(),
    }
}
