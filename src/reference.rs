//! The reference-track document: assembly, validation, and persistence.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::analyzer::beat::BeatGrid;
use crate::analyzer::key::{is_valid_label, KeyEstimate};
use crate::analyzer::phrases::Phrase;
use crate::analyzer::pitch::PitchContour;

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to replace {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Reserved: a labelled section start. Never produced by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub start: f32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceTrack {
    pub beats: Vec<f32>,
    pub downbeats: Vec<f32>,
    pub phrases: Vec<Phrase>,
    pub ref_pitch_hz: Vec<f32>,
    pub key: String,
    pub sections: Vec<Section>,
    pub loudness: Vec<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_confidence: Option<f32>,
}

/// Stage outputs handed to [`ReferenceTrack::assemble`].
#[derive(Debug, Clone)]
pub struct TrackParts {
    pub duration: f32,
    pub sample_rate: u32,
    pub hop_length: usize,
    pub beats: BeatGrid,
    pub phrases: Vec<Phrase>,
    pub pitch: PitchContour,
    pub key: KeyEstimate,
    pub key_with_mode: bool,
    pub loudness: Vec<f32>,
}

impl ReferenceTrack {
    /// Build the document from stage outputs.
    ///
    /// The loudness curve defines the frame grid: a pitch contour of another
    /// length is padded with 0.0 or truncated. Non-finite values become 0.0,
    /// times are clamped into `[0, duration]`, and phrases left empty by the
    /// clamp are dropped.
    pub fn assemble(parts: TrackParts) -> Self {
        let duration = finite_or_zero(parts.duration).max(0.0);
        let n_frames = parts.loudness.len();

        let loudness: Vec<f32> = parts.loudness.iter().map(|&v| finite_or_zero(v).max(0.0)).collect();
        let pitch = parts.pitch.sanitized();
        let ref_pitch_hz = align(pitch.hz, n_frames, "pitch contour");
        let confidence = align(pitch.confidence, n_frames, "pitch confidence");

        let mut beats: Vec<f32> = Vec::with_capacity(parts.beats.beats.len());
        for t in parts.beats.beats.iter().map(|&t| clamp_time(t, duration)) {
            if beats.last().is_none_or(|&prev| t > prev) {
                beats.push(t);
            }
        }

        let mut phrases: Vec<Phrase> = Vec::with_capacity(parts.phrases.len());
        for p in &parts.phrases {
            let (start, end) = (clamp_time(p.start, duration), clamp_time(p.end, duration));
            let after_prev = phrases.last().is_none_or(|prev| start >= prev.end);
            if start < end && after_prev {
                phrases.push(Phrase { start, end });
            }
        }

        Self {
            beats,
            downbeats: Vec::new(),
            phrases,
            ref_pitch_hz,
            key: parts.key.label(parts.key_with_mode),
            sections: Vec::new(),
            loudness,
            tempo: Some(finite_or_zero(parts.beats.tempo).max(0.0)),
            duration: Some(duration),
            sample_rate: Some(parts.sample_rate),
            hop_length: Some(parts.hop_length),
            confidence: Some(confidence),
            key_confidence: Some(finite_or_zero(parts.key.confidence).clamp(0.0, 1.0)),
        }
    }

    /// Read a document written by [`write_atomic`](Self::write_atomic) or any
    /// producer of the base schema.
    pub fn load(path: &Path) -> Result<Self, ReferenceError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the document so that `path` holds either the old content or the
    /// complete new document, never a partial one.
    pub fn write_atomic(&self, path: &Path) -> Result<(), ReferenceError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(&mut tmp);
            serde_json::to_writer(&mut writer, self)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| ReferenceError::Persist {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        log::debug!("Wrote {}", path.display());
        Ok(())
    }

    /// Check the document's invariants. Returns one message per violation.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.ref_pitch_hz.len() != self.loudness.len() {
            problems.push(format!(
                "refPitchHz has {} frames but loudness has {}",
                self.ref_pitch_hz.len(),
                self.loudness.len()
            ));
        }
        if let Some(conf) = &self.confidence {
            if conf.len() != self.ref_pitch_hz.len() {
                problems.push(format!("confidence has {} frames, refPitchHz {}", conf.len(), self.ref_pitch_hz.len()));
            }
            if conf.iter().any(|c| !(0.0..=1.0).contains(c)) {
                problems.push("confidence values outside [0, 1]".to_string());
            }
        }

        for (name, values) in [
            ("beats", &self.beats),
            ("downbeats", &self.downbeats),
            ("refPitchHz", &self.ref_pitch_hz),
            ("loudness", &self.loudness),
        ] {
            if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
                problems.push(format!("{name} contains negative or non-finite values"));
            }
        }
        if self.sections.iter().any(|s| !s.start.is_finite() || s.start < 0.0) {
            problems.push("sections contain negative or non-finite start times".to_string());
        }
        if self.beats.windows(2).any(|w| w[1] <= w[0]) {
            problems.push("beats are not strictly increasing".to_string());
        }

        for (i, p) in self.phrases.iter().enumerate() {
            let finite = p.start.is_finite() && p.end.is_finite();
            if !finite || p.start >= p.end || p.start < 0.0 {
                problems.push(format!("phrase {i} has start {} and end {}", p.start, p.end));
            }
        }
        if self.phrases.windows(2).any(|w| w[1].start < w[0].end) {
            problems.push("phrases overlap or are out of order".to_string());
        }

        if let Some(duration) = self.duration {
            let limit = duration + 1e-3;
            let late_beat = self.beats.iter().chain(&self.downbeats).any(|&t| t > limit);
            let late_phrase = self.phrases.iter().any(|p| p.end > limit);
            let late_section = self.sections.iter().any(|s| s.start > limit);
            if late_beat || late_phrase || late_section {
                problems.push(format!("time values exceed duration {duration}"));
            }
        }

        if !is_valid_label(&self.key) {
            problems.push(format!("key {:?} is not a pitch-class name", self.key));
        }
        if let Some(kc) = self.key_confidence {
            if !(0.0..=1.0).contains(&kc) {
                problems.push(format!("keyConfidence {kc} outside [0, 1]"));
            }
        }
        problems
    }
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() { v } else { 0.0 }
}

fn clamp_time(t: f32, duration: f32) -> f32 {
    finite_or_zero(t).clamp(0.0, duration)
}

/// Pad with 0.0 or truncate `values` to `len`, logging when they disagree.
fn align(mut values: Vec<f32>, len: usize, what: &str) -> Vec<f32> {
    if values.len() != len {
        log::warn!("{what} has {} frames, expected {len}; aligning", values.len());
        values.resize(len, 0.0);
    }
    values
}
