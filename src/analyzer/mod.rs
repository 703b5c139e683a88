pub mod beat;
pub mod decode;
pub mod key;
pub mod loudness;
pub mod onset;
pub mod phrases;
pub mod pitch;
pub mod spectrum;

#[cfg(test)]
mod test_signals;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use rustfft::FftPlanner;
use thiserror::Error;

use crate::config::{AnalysisConfig, TimeoutPolicy};
use crate::reference::{ReferenceError, ReferenceTrack, TrackParts};
use crate::scanner::{Job, JobPlan};
use beat::{BeatGrid, BeatTracker};
use decode::{DecodeError, Waveform};
use key::KeyEstimator;
use onset::OnsetDetector;
use pitch::{PitchContour, PitchEstimator, Yin};

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Output error: {0}")]
    Reference(#[from] ReferenceError),
    #[error("{} exceeded its {:.0}s time limit", path.display(), limit.as_secs_f64())]
    Timeout { path: PathBuf, limit: Duration },
    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl AnalyzeError {
    /// Timeouts are worth another attempt; everything else fails the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalyzeError::Timeout { .. })
    }
}

/// Degenerate input noticed during analysis. Reported, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum InputWarning {
    Silent,
    TooShort { duration: f32 },
    NoBeats,
    NoOnsets,
}

impl fmt::Display for InputWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputWarning::Silent => write!(f, "input is silent"),
            InputWarning::TooShort { duration } => write!(f, "input is only {duration:.3}s long"),
            InputWarning::NoBeats => write!(f, "no beats detected"),
            InputWarning::NoOnsets => write!(f, "no onsets detected"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub reference: ReferenceTrack,
    pub warnings: Vec<InputWarning>,
}

/// Wall-clock budget for one track.
#[derive(Debug, Clone)]
pub struct Deadline {
    path: PathBuf,
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn new(path: &Path, started: Instant, limit: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            started,
            limit,
        }
    }

    pub fn check(&self) -> Result<(), AnalyzeError> {
        if self.started.elapsed() > self.limit {
            return Err(AnalyzeError::Timeout {
                path: self.path.clone(),
                limit: self.limit,
            });
        }
        Ok(())
    }
}

fn check(deadline: Option<&Deadline>) -> Result<(), AnalyzeError> {
    deadline.map_or(Ok(()), Deadline::check)
}

/// Everything the pipeline needs that outlives one track: parameters, FFT
/// plans, filterbanks and the pitch estimator. Owned by the caller and
/// shared read-only across batch workers.
pub struct AnalysisContext {
    config: AnalysisConfig,
    onsets: OnsetDetector,
    beats: BeatTracker,
    key: KeyEstimator,
    pitch: Box<dyn PitchEstimator>,
}

impl fmt::Debug for AnalysisContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisContext")
            .field("config", &self.config)
            .field("pitch", &self.pitch.name())
            .finish()
    }
}

impl AnalysisContext {
    /// Build the stages for `config`; unusable parameters fall back to the defaults.
    pub fn new(config: AnalysisConfig) -> Self {
        let config = match config.check() {
            Ok(()) => config,
            Err(e) => {
                log::warn!("Invalid analysis parameters ({}). Using defaults.", e);
                AnalysisConfig::default()
            }
        };
        let mut planner = FftPlanner::new();
        Self {
            onsets: OnsetDetector::new(&mut planner, &config),
            beats: BeatTracker::new(&config),
            key: KeyEstimator::new(&mut planner, &config),
            pitch: Box::new(Yin::new(&config)),
            config,
        }
    }

    /// Replace the default YIN tracker.
    pub fn with_pitch_estimator(mut self, estimator: Box<dyn PitchEstimator>) -> Self {
        self.pitch = estimator;
        self
    }

    /// Run every stage on `waveform` and assemble the reference track.
    ///
    /// A waveform at another rate is resampled to the analysis rate first.
    pub fn analyze_waveform(&self, waveform: &Waveform, deadline: Option<&Deadline>) -> Result<Analysis, AnalyzeError> {
        let cfg = &self.config;
        let resampled;
        let waveform = if waveform.sample_rate == cfg.sample_rate {
            waveform
        } else {
            resampled = Waveform::new(
                decode::resample(waveform.samples.clone(), waveform.sample_rate, cfg.sample_rate)?,
                cfg.sample_rate,
            );
            &resampled
        };

        let duration = waveform.duration();
        let mut warnings = Vec::new();
        if waveform.samples.len() < cfg.frame_length {
            warnings.push(InputWarning::TooShort { duration });
        }
        if waveform.is_silent() {
            warnings.push(InputWarning::Silent);
        }

        let (rhythm, (pitch, (key, loudness))) = if cfg.parallel_stages {
            rayon::join(
                || self.rhythm(waveform, deadline),
                || {
                    rayon::join(
                        || self.pitch(waveform),
                        || rayon::join(|| self.key.estimate(&waveform.samples), || self.loudness(waveform)),
                    )
                },
            )
        } else {
            let rhythm = self.rhythm(waveform, deadline);
            check(deadline)?;
            let pitch = self.pitch(waveform);
            check(deadline)?;
            let key = self.key.estimate(&waveform.samples);
            (rhythm, (pitch, (key, self.loudness(waveform))))
        };
        let (grid, onsets) = rhythm?;
        check(deadline)?;

        let phrases = phrases::segment(&onsets, &grid.beats, cfg.phrase_gap, cfg.beats_per_phrase);
        if grid.beats.is_empty() {
            warnings.push(InputWarning::NoBeats);
        }
        if onsets.is_empty() {
            warnings.push(InputWarning::NoOnsets);
        }
        for w in &warnings {
            log::warn!("Degenerate input: {}", w);
        }

        let reference = ReferenceTrack::assemble(TrackParts {
            duration,
            sample_rate: waveform.sample_rate,
            hop_length: cfg.pitch_hop,
            beats: grid,
            phrases,
            pitch,
            key,
            key_with_mode: cfg.key_with_mode,
            loudness,
        });
        Ok(Analysis { reference, warnings })
    }

    fn rhythm(&self, waveform: &Waveform, deadline: Option<&Deadline>) -> Result<(BeatGrid, Vec<f32>), AnalyzeError> {
        let envelope = self.onsets.strength(&waveform.samples);
        check(deadline)?;
        let grid = self.beats.track(&envelope);
        let onsets = self.onsets.detect(&envelope);
        log::debug!("{} onsets", onsets.len());
        Ok((grid, onsets))
    }

    fn pitch(&self, waveform: &Waveform) -> PitchContour {
        let contour = self.pitch.estimate_pitch(waveform, self.config.pitch_hop);
        log::debug!(
            "{}: {} of {} frames voiced",
            self.pitch.name(),
            contour.voiced().count(),
            contour.hz.len()
        );
        contour
    }

    fn loudness(&self, waveform: &Waveform) -> Vec<f32> {
        loudness::rms_curve(&waveform.samples, self.config.frame_length, self.config.pitch_hop)
    }

    /// Decode `input`, analyze it and write the reference JSON to `output`.
    ///
    /// With a `timeout`, the track is abandoned between stages once its
    /// duration-derived limit has passed.
    pub fn analyze_file(
        &self,
        input: &Path,
        output: &Path,
        timeout: Option<&TimeoutPolicy>,
    ) -> Result<Analysis, AnalyzeError> {
        let started = Instant::now();
        log::debug!(
            "Analyzing: {}",
            input.file_name().and_then(|f| f.to_str()).unwrap_or("?")
        );

        let waveform = decode::load_waveform(input, self.config.sample_rate)?;
        let duration = waveform.duration();
        let deadline = timeout.map(|t| Deadline::new(input, started, t.limit_for(duration as f64)));
        check(deadline.as_ref())?;

        let analysis = self.analyze_waveform(&waveform, deadline.as_ref())?;
        analysis.reference.write_atomic(output)?;

        let elapsed = started.elapsed().as_secs_f64().max(1e-6);
        log::info!(
            "{}: {:.1}s analyzed in {:.2}s ({:.1}x real time)",
            input.display(),
            duration,
            elapsed,
            duration as f64 / elapsed
        );
        Ok(analysis)
    }
}

/// Batch execution settings.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub workers: usize,
    pub retries: u32,
    pub timeout: Option<TimeoutPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub analyzed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub skipped: u64,
}

/// Analyze every job of `plan` on a dedicated pool, one worker per track.
///
/// Jobs are processed in chunks of `workers * 2`. Tracks that time out are
/// queued and retried after the main pass, up to `options.retries` times.
pub fn analyze_batch(
    plan: &JobPlan,
    ctx: &AnalysisContext,
    options: &BatchOptions,
) -> Result<BatchResult, AnalyzeError> {
    let mut result = BatchResult {
        skipped: (plan.skipped.len() + plan.collisions.len()) as u64,
        ..Default::default()
    };
    if plan.jobs.is_empty() {
        log::info!("No tracks to analyze");
        return Ok(result);
    }

    let workers = options.workers.max(1);
    log::info!("Analyzing {} tracks with {} workers", plan.jobs.len(), workers);

    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
    let pb = ProgressBar::new(plan.jobs.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let mut pending: Vec<&Job> = plan.jobs.iter().collect();
    for attempt in 0..=options.retries {
        if pending.is_empty() {
            break;
        }
        if attempt > 0 {
            log::info!("Retrying {} timed-out tracks (attempt {})", pending.len(), attempt + 1);
            pb.set_message(format!("retry {attempt}"));
        }

        let mut timed_out = Vec::new();
        for chunk in pending.chunks(workers * 2) {
            let outcomes: Vec<_> = pool.install(|| {
                use rayon::prelude::*;
                chunk
                    .par_iter()
                    .map(|job| {
                        let outcome = ctx.analyze_file(&job.input, &job.output, options.timeout.as_ref());
                        if !matches!(&outcome, Err(e) if e.is_retryable()) {
                            pb.inc(1);
                        }
                        (*job, outcome)
                    })
                    .collect()
            });

            for (job, outcome) in outcomes {
                match outcome {
                    Ok(_) => result.analyzed += 1,
                    Err(e) if e.is_retryable() => {
                        log::warn!("{}", e);
                        timed_out.push(job);
                    }
                    Err(e) => {
                        log::warn!("Analysis failed for {}: {}", job.input.display(), e);
                        result.failed += 1;
                    }
                }
            }
            pb.set_message(format!("{} written, {} failed", result.analyzed, result.failed));
        }
        pending = timed_out;
    }

    result.timed_out = pending.len() as u64;
    pb.inc(result.timed_out);
    for job in &pending {
        log::error!("Giving up on {} after {} attempts", job.input.display(), options.retries + 1);
    }
    pb.finish_with_message(format!(
        "Done: {} analyzed, {} failed, {} timed out",
        result.analyzed, result.failed, result.timed_out
    ));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AnalysisContext {
        AnalysisContext::new(AnalysisConfig::default())
    }

    fn wave(samples: Vec<f32>) -> Waveform {
        Waveform::new(samples, 16_000)
    }

    #[test]
    fn test_pitch_and_loudness_aligned() {
        let ctx = context();
        for secs in [0.05, 1.0, 3.3] {
            let w = wave(test_signals::tone(440.0, secs, 16_000));
            let track = ctx.analyze_waveform(&w, None).unwrap().reference;
            assert_eq!(track.ref_pitch_hz.len(), track.loudness.len());
            let expected = (w.duration() / 0.02).ceil();
            assert!((track.loudness.len() as f32 - expected).abs() <= 1.0);
            assert!(track.validate().is_empty(), "{:?}", track.validate());
        }
    }

    #[test]
    fn test_silence_is_neutral() {
        let analysis = context().analyze_waveform(&wave(test_signals::silence(3.0, 16_000)), None).unwrap();
        let track = &analysis.reference;
        assert_eq!(track.duration, Some(3.0));
        assert!(track.beats.is_empty());
        assert!(track.phrases.is_empty());
        assert!(track.ref_pitch_hz.iter().all(|&f| f == 0.0));
        assert!(track.loudness.iter().all(|&v| v.abs() < 1e-6));
        assert_eq!(track.key, "C");
        assert!(analysis.warnings.contains(&InputWarning::Silent));
        assert!(analysis.warnings.contains(&InputWarning::NoBeats));
        assert!(analysis.warnings.contains(&InputWarning::NoOnsets));
    }

    #[test]
    fn test_empty_waveform_does_not_fail() {
        let analysis = context().analyze_waveform(&wave(Vec::new()), None).unwrap();
        assert_eq!(analysis.reference.duration, Some(0.0));
        assert_eq!(analysis.reference.loudness.len(), analysis.reference.ref_pitch_hz.len());
        assert!(analysis.warnings.contains(&InputWarning::TooShort { duration: 0.0 }));
    }

    #[test]
    fn test_click_track_tempo() {
        let w = wave(test_signals::click_track(120.0, 12.0, 16_000));
        let track = context().analyze_waveform(&w, None).unwrap().reference;
        let tempo = track.tempo.unwrap();
        assert!((tempo - 120.0).abs() <= 10.0, "tempo {tempo}");
        assert!(!track.phrases.is_empty());
        assert!(track.validate().is_empty(), "{:?}", track.validate());
    }

    #[test]
    fn test_tone_key_is_a() {
        let w = wave(test_signals::tone(440.0, 2.0, 16_000));
        assert_eq!(context().analyze_waveform(&w, None).unwrap().reference.key, "A");
    }

    #[test]
    fn test_parallel_and_sequential_agree() {
        let w = wave(test_signals::tone_with_beats(6.0, 16_000));
        let parallel = context().analyze_waveform(&w, None).unwrap().reference;
        let config = AnalysisConfig {
            parallel_stages: false,
            ..AnalysisConfig::default()
        };
        let sequential = AnalysisContext::new(config).analyze_waveform(&w, None).unwrap().reference;
        assert_eq!(parallel, sequential);
        // Idempotent
        assert_eq!(context().analyze_waveform(&w, None).unwrap().reference, parallel);
    }

    #[test]
    fn test_other_sample_rates_are_resampled() {
        let w = Waveform::new(test_signals::tone(440.0, 1.0, 22_050), 22_050);
        let track = context().analyze_waveform(&w, None).unwrap().reference;
        assert_eq!(track.sample_rate, Some(16_000));
        assert_eq!(track.loudness.len(), 51);
    }

    struct Flat;

    impl PitchEstimator for Flat {
        fn name(&self) -> &str {
            "flat"
        }

        fn estimate_pitch(&self, waveform: &Waveform, hop: usize) -> PitchContour {
            // Deliberately one frame short of the grid
            let n = waveform.samples.len() / hop;
            PitchContour {
                hz: vec![123.0; n],
                confidence: vec![1.0; n],
            }
        }
    }

    #[test]
    fn test_pluggable_estimator_is_aligned() {
        let ctx = context().with_pitch_estimator(Box::new(Flat));
        let w = wave(test_signals::tone(440.0, 1.0, 16_000));
        let track = ctx.analyze_waveform(&w, None).unwrap().reference;
        assert_eq!(track.ref_pitch_hz.len(), track.loudness.len());
        assert_eq!(track.ref_pitch_hz[0], 123.0);
        assert_eq!(*track.ref_pitch_hz.last().unwrap(), 0.0);
    }

    #[test]
    fn test_odd_frame_sizes_analyze() {
        let ctx = AnalysisContext::new(AnalysisConfig {
            frame_length: 2047,
            onset_n_fft: 2047,
            chroma_n_fft: 4095,
            ..AnalysisConfig::default()
        });
        let track = ctx
            .analyze_waveform(&wave(test_signals::tone(440.0, 1.0, 16_000)), None)
            .unwrap()
            .reference;
        assert_eq!(track.loudness.len(), 51);
        assert_eq!(track.ref_pitch_hz.len(), 51);
        assert_eq!(track.key, "A");
    }

    #[test]
    fn test_unusable_config_falls_back_to_defaults() {
        let ctx = AnalysisContext::new(AnalysisConfig {
            pitch_hop: 0,
            ..AnalysisConfig::default()
        });
        let track = ctx
            .analyze_waveform(&wave(test_signals::tone(440.0, 1.0, 16_000)), None)
            .unwrap()
            .reference;
        assert_eq!(track.hop_length, Some(320));
        assert_eq!(track.loudness.len(), 51);
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let deadline = Deadline::new(Path::new("slow.wav"), Instant::now(), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        let w = wave(test_signals::tone(440.0, 1.0, 16_000));
        let err = context().analyze_waveform(&w, Some(&deadline)).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, AnalyzeError::Timeout { .. }));
    }

    #[test]
    fn test_batch_counts_failures_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("broken.wav");
        std::fs::write(&bad, b"not a wav").unwrap();
        let plan = JobPlan {
            jobs: vec![Job {
                input: bad,
                output: dir.path().join("broken.json"),
            }],
            skipped: vec![dir.path().join("done.wav")],
            collisions: Vec::new(),
        };
        let options = BatchOptions {
            workers: 1,
            retries: 1,
            timeout: None,
        };
        let result = analyze_batch(&plan, &context(), &options).unwrap();
        assert_eq!(
            result,
            BatchResult {
                analyzed: 0,
                failed: 1,
                timed_out: 0,
                skipped: 1
            }
        );
        assert!(!dir.path().join("broken.json").exists());
    }
}
