//! Monophonic fundamental-frequency tracking.
//!
//! [`PitchEstimator`] is the seam the pipeline calls; [`Yin`] is the default
//! implementation. Any estimator must return one value per `hop` on the
//! centered frame grid (`1 + len / hop` frames) so the contour lines up with
//! the loudness curve.

use super::decode::Waveform;
use super::spectrum::{centered_frame_count, centered_frames, pad_center};
use crate::config::AnalysisConfig;

/// Fundamental frequency per frame, 0.0 for unvoiced frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PitchContour {
    pub hz: Vec<f32>,
    /// Voicing confidence per frame in [0, 1], aligned with `hz`.
    pub confidence: Vec<f32>,
}

impl PitchContour {
    /// Replace NaN, infinite and negative estimates with 0.0 (unvoiced),
    /// zeroing the matching confidence.
    pub fn sanitized(mut self) -> Self {
        self.confidence.resize(self.hz.len(), 0.0);
        for (f, c) in self.hz.iter_mut().zip(self.confidence.iter_mut()) {
            if !f.is_finite() || *f <= 0.0 {
                *f = 0.0;
                *c = 0.0;
            } else if !c.is_finite() {
                *c = 0.0;
            } else {
                *c = c.clamp(0.0, 1.0);
            }
        }
        self
    }

    pub fn voiced(&self) -> impl Iterator<Item = f32> + '_ {
        self.hz.iter().copied().filter(|&f| f > 0.0)
    }
}

/// A replaceable pitch tracker.
pub trait PitchEstimator: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Estimate the contour of `waveform` at `hop` samples per frame.
    fn estimate_pitch(&self, waveform: &Waveform, hop: usize) -> PitchContour;
}

/// YIN: cumulative-mean-normalized difference function with an absolute threshold.
#[derive(Debug, Clone)]
pub struct Yin {
    pub frame_length: usize,
    pub fmin: f32,
    pub fmax: f32,
    pub threshold: f32,
}

impl Yin {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            frame_length: config.frame_length,
            fmin: config.fmin,
            fmax: config.fmax,
            threshold: config.yin_threshold,
        }
    }

    /// Lag search range in samples for `sample_rate`.
    fn period_range(&self, sample_rate: u32) -> (usize, usize) {
        let sr = sample_rate as f32;
        let win = self.frame_length / 2;
        let min_period = ((sr / self.fmax).floor() as usize).max(2);
        let max_period = ((sr / self.fmin).ceil() as usize).min(self.frame_length - win - 1);
        (min_period, max_period)
    }

    /// Estimate one frame. Returns `(hz, confidence)`, `(0.0, 0.0)` when unvoiced.
    fn frame(&self, frame: &[f32], sample_rate: u32, diff: &mut [f32], cmnd: &mut [f32]) -> (f32, f32) {
        let (min_period, max_period) = self.period_range(sample_rate);
        if min_period + 1 >= max_period {
            return (0.0, 0.0);
        }
        let win = self.frame_length / 2;

        let energy: f32 = frame[..win + max_period].iter().map(|x| x * x).sum();
        if energy < 1e-8 {
            return (0.0, 0.0);
        }

        for tau in 1..=max_period {
            diff[tau] = frame[..win]
                .iter()
                .zip(&frame[tau..tau + win])
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
        }

        cmnd[0] = 1.0;
        let mut running = 0.0f32;
        for tau in 1..=max_period {
            running += diff[tau];
            cmnd[tau] = if running > 1e-12 { diff[tau] * tau as f32 / running } else { 1.0 };
        }

        let Some(mut tau) = (min_period..=max_period).find(|&t| cmnd[t] < self.threshold) else {
            return (0.0, 0.0);
        };
        while tau < max_period && cmnd[tau + 1] < cmnd[tau] {
            tau += 1;
        }

        let refined = if tau > min_period && tau < max_period {
            let (a, b, c) = (cmnd[tau - 1], cmnd[tau], cmnd[tau + 1]);
            let denom = a - 2.0 * b + c;
            let shift = if denom.abs() > 1e-12 { 0.5 * (a - c) / denom } else { 0.0 };
            tau as f32 + shift.clamp(-1.0, 1.0)
        } else {
            tau as f32
        };

        let hz = sample_rate as f32 / refined;
        if !hz.is_finite() {
            return (0.0, 0.0);
        }
        (hz.clamp(self.fmin, self.fmax), (1.0 - cmnd[tau]).clamp(0.0, 1.0))
    }
}

impl PitchEstimator for Yin {
    fn name(&self) -> &str {
        "yin"
    }

    fn estimate_pitch(&self, waveform: &Waveform, hop: usize) -> PitchContour {
        let n_frames = centered_frame_count(waveform.samples.len(), hop);
        let padded = pad_center(&waveform.samples, self.frame_length);
        let (_, max_period) = self.period_range(waveform.sample_rate);
        let mut diff = vec![0.0f32; max_period + 1];
        let mut cmnd = vec![0.0f32; max_period + 1];

        let (hz, confidence) = centered_frames(&padded, self.frame_length, hop, n_frames)
            .map(|frame| self.frame(frame, waveform.sample_rate, &mut diff, &mut cmnd))
            .unzip();

        PitchContour { hz, confidence }.sanitized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::test_signals;

    fn yin() -> Yin {
        Yin::new(&AnalysisConfig::default())
    }

    #[test]
    fn test_period_range_for_defaults() {
        assert_eq!(yin().period_range(16_000), (16, 320));
    }

    #[test]
    fn test_pure_tone_tracks_440() {
        let wave = Waveform::new(test_signals::tone(440.0, 2.0, 16_000), 16_000);
        let contour = yin().estimate_pitch(&wave, 320);
        assert_eq!(contour.hz.len(), 1 + wave.samples.len() / 320);
        assert_eq!(contour.confidence.len(), contour.hz.len());

        let voiced: Vec<f32> = contour.voiced().collect();
        assert!(voiced.len() as f32 >= 0.9 * contour.hz.len() as f32);
        let mean = voiced.iter().sum::<f32>() / voiced.len() as f32;
        assert!((mean - 440.0).abs() < 3.0, "mean pitch {mean}");
        assert!(contour.confidence.iter().all(|c| (0.0..=1.0).contains(c)));
    }

    #[test]
    fn test_low_tone_within_range() {
        let wave = Waveform::new(test_signals::tone(110.0, 1.0, 16_000), 16_000);
        let contour = yin().estimate_pitch(&wave, 320);
        let mid = contour.hz[contour.hz.len() / 2];
        assert!((mid - 110.0).abs() < 2.0, "mid frame {mid}");
    }

    #[test]
    fn test_silence_is_unvoiced() {
        let wave = Waveform::new(test_signals::silence(1.0, 16_000), 16_000);
        let contour = yin().estimate_pitch(&wave, 320);
        assert_eq!(contour.hz.len(), 51);
        assert!(contour.hz.iter().all(|&f| f == 0.0));
        assert!(contour.confidence.iter().all(|&c| c == 0.0));
    }

    #[test]
    fn test_sanitize_replaces_nan_and_negative() {
        let contour = PitchContour {
            hz: vec![f32::NAN, -3.0, 220.0, f32::INFINITY],
            confidence: vec![0.5, 0.5, 1.5],
        }
        .sanitized();
        assert_eq!(contour.hz, vec![0.0, 0.0, 220.0, 0.0]);
        assert_eq!(contour.confidence, vec![0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_estimator_is_object_safe() {
        let estimator: Box<dyn PitchEstimator> = Box::new(yin());
        assert_eq!(estimator.name(), "yin");
        let wave = Waveform::new(vec![0.0; 640], 16_000);
        assert_eq!(estimator.estimate_pitch(&wave, 320).hz.len(), 3);
    }
}
