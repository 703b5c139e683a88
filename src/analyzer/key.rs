//! Key estimation from whole-track chroma energy.

use std::fmt;

use rustfft::FftPlanner;

use super::spectrum::Stft;
use crate::config::AnalysisConfig;

/// Pitch-class names in index order; index 0 is C.
pub const PITCH_CLASSES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Krumhansl-Kessler probe-tone profiles, rooted at index 0.
const MAJOR_PROFILE: [f32; 12] = [6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88];
const MINOR_PROFILE: [f32; 12] = [6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Major,
    Minor,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Major => write!(f, "major"),
            Mode::Minor => write!(f, "minor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyEstimate {
    /// Index into [`PITCH_CLASSES`].
    pub pitch_class: usize,
    pub mode: Mode,
    /// Margin of the strongest class over the runner-up, relative to the strongest.
    pub confidence: f32,
    /// Aggregate chroma energy per pitch class.
    pub chroma: [f32; 12],
}

impl KeyEstimate {
    pub fn name(&self) -> &'static str {
        PITCH_CLASSES[self.pitch_class]
    }

    /// `"A"`, or `"A minor"` when `with_mode` is set.
    pub fn label(&self, with_mode: bool) -> String {
        if with_mode {
            format!("{} {}", self.name(), self.mode)
        } else {
            self.name().to_string()
        }
    }
}

/// Whether `label` is a pitch-class name, optionally followed by `major` or `minor`.
pub fn is_valid_label(label: &str) -> bool {
    let mut parts = label.split(' ');
    let name_ok = parts.next().is_some_and(|n| PITCH_CLASSES.contains(&n));
    let mode_ok = match parts.next() {
        None => true,
        Some(m) => m == "major" || m == "minor",
    };
    name_ok && mode_ok && parts.next().is_none()
}

#[derive(Debug, Clone)]
pub struct KeyEstimator {
    stft: Stft,
    /// Pitch class of each STFT bin, `None` below `fmin`.
    bin_classes: Vec<Option<usize>>,
}

impl KeyEstimator {
    pub fn new(planner: &mut FftPlanner<f32>, config: &AnalysisConfig) -> Self {
        let stft = Stft::new(planner, config.chroma_n_fft, config.chroma_hop);
        let bin_classes = (0..stft.n_bins())
            .map(|k| {
                let freq = stft.bin_frequency(k, config.sample_rate);
                (freq >= config.chroma_fmin && freq > 0.0).then(|| pitch_class_of(freq))
            })
            .collect();
        Self { stft, bin_classes }
    }

    /// Whole-track chroma: per-frame pitch-class power, each frame scaled to
    /// a maximum of 1.0, summed over frames. Silent frames contribute nothing.
    pub fn chroma(&self, samples: &[f32]) -> [f32; 12] {
        let mut total = [0.0f32; 12];
        for frame in self.stft.power(samples) {
            let mut chroma = [0.0f32; 12];
            for (power, class) in frame.iter().zip(&self.bin_classes) {
                if let Some(pc) = class {
                    chroma[*pc] += power;
                }
            }
            let peak = chroma.iter().copied().fold(0.0f32, f32::max);
            if peak > 0.0 && peak.is_finite() {
                for (t, c) in total.iter_mut().zip(chroma) {
                    *t += c / peak;
                }
            }
        }
        total
    }

    pub fn estimate(&self, samples: &[f32]) -> KeyEstimate {
        let chroma = self.chroma(samples);
        let key = estimate_from_chroma(chroma);
        log::debug!("Key {} ({}, confidence {:.2})", key.name(), key.mode, key.confidence);
        key
    }
}

/// Pick the strongest class (lowest index on ties), its mode and confidence.
pub fn estimate_from_chroma(chroma: [f32; 12]) -> KeyEstimate {
    let mut root = 0;
    for (i, &v) in chroma.iter().enumerate() {
        if v > chroma[root] {
            root = i;
        }
    }
    let top = chroma[root];
    let second = chroma
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != root)
        .map(|(_, &v)| v)
        .fold(0.0f32, f32::max);
    let confidence = if top > 0.0 { ((top - second) / top).clamp(0.0, 1.0) } else { 0.0 };

    KeyEstimate {
        pitch_class: root,
        mode: mode_at(&chroma, root),
        confidence,
        chroma,
    }
}

/// Major unless the minor profile correlates strictly better at `root`.
fn mode_at(chroma: &[f32; 12], root: usize) -> Mode {
    let rotated: [f32; 12] = std::array::from_fn(|i| chroma[(root + i) % 12]);
    match (pearson(&rotated, &MAJOR_PROFILE), pearson(&rotated, &MINOR_PROFILE)) {
        (Some(major), Some(minor)) if minor > major => Mode::Minor,
        _ => Mode::Major,
    }
}

fn pearson(a: &[f32; 12], b: &[f32; 12]) -> Option<f32> {
    let mean_a = a.iter().sum::<f32>() / 12.0;
    let mean_b = b.iter().sum::<f32>() / 12.0;
    let (mut cov, mut var_a, mut var_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denom = (var_a * var_b).sqrt();
    (denom > 0.0).then(|| cov / denom)
}

/// Nearest equal-tempered pitch class of `freq` (A4 = 440 Hz).
fn pitch_class_of(freq: f32) -> usize {
    let semitones_from_a = (12.0 * (freq / 440.0).log2()).round() as i32;
    (semitones_from_a + 9).rem_euclid(12) as usize
}
