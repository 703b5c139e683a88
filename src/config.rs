use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;

/// Application configuration loaded from TOML config file.
/// All fields have defaults; the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Number of parallel workers for batch mode. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Hard per-track time limit in seconds. 0 = derive from track duration.
    pub timeout_secs: u64,
    /// Throughput target used to derive per-track limits (track seconds per wall second).
    pub min_realtime_factor: Option<f64>,
    /// How many times a timed-out track is retried at the end of a batch.
    pub retries: Option<u32>,
    /// Default output directory for batch mode.
    pub out_dir: Option<PathBuf>,
    /// Numeric analysis parameters.
    pub analysis: AnalysisConfig,
}

/// Numeric parameters of the extraction pipeline.
///
/// Defaults reproduce the reference numerics that downstream scoring was
/// calibrated against; change them only if every consumer is re-calibrated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Analysis sample rate. Every input is resampled to this.
    pub sample_rate: u32,

    /// STFT size for the onset-strength envelope.
    pub onset_n_fft: usize,
    /// Hop between onset-strength frames (samples).
    pub onset_hop: usize,
    /// Mel bands used for the onset-strength envelope.
    pub n_mels: usize,

    /// Peak picking windows, in seconds.
    pub pre_max: f32,
    pub post_max: f32,
    pub pre_avg: f32,
    pub post_avg: f32,
    pub wait: f32,
    /// Peak picking offset above the local mean (normalized envelope units).
    pub delta: f32,

    /// Center of the log-normal tempo prior.
    pub start_bpm: f32,
    /// Beat tracker tightness: how strongly beats are held to the tempo.
    pub tightness: f32,
    pub min_bpm: f32,
    pub max_bpm: f32,

    /// Analysis window for pitch and loudness (samples).
    pub frame_length: usize,
    /// Hop for pitch and loudness (samples). 320 @ 16 kHz = 20 ms.
    pub pitch_hop: usize,
    pub fmin: f32,
    pub fmax: f32,
    /// Cumulative-mean-normalized-difference threshold for a voiced frame.
    pub yin_threshold: f32,

    pub chroma_n_fft: usize,
    pub chroma_hop: usize,
    /// Lowest frequency folded into chroma (C1).
    pub chroma_fmin: f32,

    /// Minimum onset gap (seconds) that closes a phrase.
    pub phrase_gap: f32,
    /// Beats per phrase when falling back to the beat grid.
    pub beats_per_phrase: usize,

    /// Write the key as "<name> major|minor" instead of the bare pitch class.
    pub key_with_mode: bool,
    /// Run the independent stages of one track concurrently.
    pub parallel_stages: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            onset_n_fft: 2048,
            onset_hop: 512,
            n_mels: 128,
            pre_max: 0.03,
            post_max: 0.0,
            pre_avg: 0.10,
            post_avg: 0.10,
            wait: 0.03,
            delta: 0.07,
            start_bpm: 120.0,
            tightness: 100.0,
            min_bpm: 30.0,
            max_bpm: 300.0,
            frame_length: 2048,
            pitch_hop: 320,
            fmin: 50.0,
            fmax: 1000.0,
            yin_threshold: 0.1,
            chroma_n_fft: 4096,
            chroma_hop: 512,
            chroma_fmin: 32.70,
            phrase_gap: 1.0,
            beats_per_phrase: 4,
            key_with_mode: false,
            parallel_stages: true,
        }
    }
}

impl AnalysisConfig {
    /// Reject parameter sets the pipeline cannot run with.
    pub fn check(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample_rate must be positive".into());
        }
        if self.onset_hop == 0 || self.pitch_hop == 0 || self.chroma_hop == 0 {
            return Err("hop sizes must be positive".into());
        }
        if self.onset_n_fft < 2 || self.chroma_n_fft < 2 || self.frame_length < 4 || self.n_mels == 0 {
            return Err("frame sizes are too small".into());
        }
        if !(self.fmin > 0.0 && self.fmax > self.fmin) {
            return Err(format!("invalid pitch range {}..{} Hz", self.fmin, self.fmax));
        }
        if !(self.min_bpm > 0.0 && self.max_bpm > self.min_bpm && self.start_bpm > 0.0) {
            return Err(format!("invalid tempo range {}..{} BPM", self.min_bpm, self.max_bpm));
        }
        Ok(())
    }

    /// Convert a peak-picking window in seconds to whole frames (`secs * sr // hop`).
    pub fn secs_to_onset_frames(&self, secs: f32) -> usize {
        ((secs * self.sample_rate as f32) / self.onset_hop as f32).floor() as usize
    }
}

impl AppConfig {
    /// Load config from `~/.config/reftrack/config.toml`, or from `path` when given.
    /// Returns default config if the file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load(path: Option<&Path>) -> Self {
        let config_path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::config_path(),
        };
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(mut config) => {
                        log::info!("Loaded config from {}", path.display());
                        if let Err(e) = config.analysis.check() {
                            log::warn!("Ignoring [analysis] in {}: {}", path.display(), e);
                            config.analysis = AnalysisConfig::default();
                        }
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<AppConfig>(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Per-track batch limits.
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            fixed: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
            min_realtime_factor: self.min_realtime_factor.unwrap_or(2.0),
            grace: Duration::from_secs(30),
        }
    }

    pub fn resolve_retries(&self) -> u32 {
        self.retries.unwrap_or(1)
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// How long one track may take before it is abandoned as a retryable failure.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    /// Hard limit, overriding the duration-derived one.
    pub fixed: Option<Duration>,
    pub min_realtime_factor: f64,
    pub grace: Duration,
}

impl TimeoutPolicy {
    /// Limit for a track of `track_secs` seconds.
    pub fn limit_for(&self, track_secs: f64) -> Duration {
        if let Some(fixed) = self.fixed {
            return fixed;
        }
        let factor = if self.min_realtime_factor > 0.0 {
            self.min_realtime_factor
        } else {
            1.0
        };
        self.grace + Duration::from_secs_f64(track_secs.max(0.0) / factor)
    }
}
