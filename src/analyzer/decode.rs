//! Waveform loading: decode, downmix to mono, resample to the analysis rate.

use std::fs::File;
use std::path::Path;

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unrecognized audio format: {0}")]
    Probe(String),
    #[error("No decodable audio track")]
    NoTrack,
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Resampling failed: {0}")]
    Resample(String),
    #[error("File contains no audio samples")]
    Empty,
}

/// Mono audio at a fixed sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Length in seconds.
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// True when every sample is (effectively) zero.
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| s.abs() < 1e-6)
    }
}

/// Decode `path` to a mono waveform at `target_rate`.
///
/// FLAC goes through claxon; everything else through symphonia's probe.
pub fn load_waveform(path: &Path, target_rate: u32) -> Result<Waveform, DecodeError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let (interleaved, source_rate, channels) = if ext == "flac" {
        decode_flac(path)?
    } else {
        decode_symphonia(path, &ext)?
    };
    if interleaved.is_empty() || channels == 0 {
        return Err(DecodeError::Empty);
    }

    let mono = downmix(&interleaved, channels);
    log::debug!(
        "Decoded {}: {} frames at {} Hz, {} channel(s)",
        path.display(),
        mono.len(),
        source_rate,
        channels
    );

    let samples = resample(mono, source_rate, target_rate)?;
    Ok(Waveform::new(samples, target_rate))
}

fn decode_flac(path: &Path) -> Result<(Vec<f32>, u32, usize), DecodeError> {
    let mut reader = claxon::FlacReader::open(path).map_err(flac_error)?;
    let info = reader.streaminfo();
    let scale = 1.0 / (1u64 << (info.bits_per_sample.saturating_sub(1))) as f32;

    let mut samples = Vec::with_capacity(info.samples.unwrap_or(0) as usize * info.channels as usize);
    for sample in reader.samples() {
        samples.push(sample.map_err(flac_error)? as f32 * scale);
    }
    Ok((samples, info.sample_rate, info.channels as usize))
}

fn flac_error(e: claxon::Error) -> DecodeError {
    match e {
        claxon::Error::IoError(io) => DecodeError::Io(io),
        claxon::Error::FormatError(msg) => DecodeError::Probe(msg.to_string()),
        other => DecodeError::Codec(other.to_string()),
    }
}

fn decode_symphonia(path: &Path, ext: &str) -> Result<(Vec<f32>, u32, usize), DecodeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if !ext.is_empty() {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::Probe(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoTrack)?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut channels = track.codec_params.channels.map(|c| c.count());

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Codec(e.to_string()))?;

    let mut samples = Vec::new();
    let mut buffer: Option<(SampleBuffer<f32>, usize)> = None;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(DecodeError::Codec(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate.get_or_insert(spec.rate);
                channels.get_or_insert(spec.channels.count());

                let frames = decoded.capacity();
                if buffer.as_ref().is_none_or(|(_, cap)| *cap < frames) {
                    buffer = Some((SampleBuffer::new(frames as u64, spec), frames));
                }
                if let Some((buf, _)) = buffer.as_mut() {
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
            }
            Err(SymphoniaError::DecodeError(msg)) => {
                log::warn!("Skipping corrupt packet in {}: {}", path.display(), msg);
            }
            Err(e) => return Err(DecodeError::Codec(e.to_string())),
        }
    }

    let sample_rate = sample_rate.ok_or_else(|| DecodeError::Codec("unknown sample rate".into()))?;
    Ok((samples, sample_rate, channels.unwrap_or(1)))
}

/// Average interleaved channels into one.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample mono `samples` from `from` Hz to `to` Hz.
///
/// The output has `round(len * to / from)` samples with the resampler's
/// delay removed.
pub fn resample(samples: Vec<f32>, from: u32, to: u32) -> Result<Vec<f32>, DecodeError> {
    if from == to || samples.is_empty() {
        return Ok(samples);
    }
    if from == 0 || to == 0 {
        return Err(DecodeError::Resample(format!("invalid rates {from} -> {to}")));
    }

    let ratio = to as f64 / from as f64;
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let mut resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Septic, samples.len(), 1)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;
    let delay = resampler.output_delay();

    let mut out = resampler
        .process(&[samples], None)
        .map_err(|e| DecodeError::Resample(e.to_string()))?
        .swap_remove(0);
    let tail = resampler
        .process_partial(None::<&[Vec<f32>]>, None)
        .map_err(|e| DecodeError::Resample(e.to_string()))?
        .swap_remove(0);
    out.extend(tail);

    let mut out: Vec<f32> = out.into_iter().skip(delay).collect();
    out.resize(expected, 0.0);
    log::debug!("Resampled {} Hz -> {} Hz ({} samples)", from, to, out.len());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix(&[0.25, 0.5], 1), vec![0.25, 0.5]);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(samples.clone(), 16_000, 16_000).unwrap(), samples);
        assert!(resample(Vec::new(), 44_100, 16_000).unwrap().is_empty());
    }

    #[test]
    fn test_resample_length_and_level() {
        let from = 44_100;
        let tone: Vec<f32> = (0..from)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / from as f32).sin())
            .collect();
        let out = resample(tone, from, 16_000).unwrap();
        assert_eq!(out.len(), 16_000);
        let rms = (out[4000..12000].iter().map(|x| x * x).sum::<f32>() / 8000.0).sqrt();
        assert_abs_diff_eq!(rms, 0.5 / 2f32.sqrt(), epsilon = 0.02);
    }

    #[test]
    fn test_waveform_duration_and_silence() {
        let w = Waveform::new(vec![0.0; 8000], 16_000);
        assert_abs_diff_eq!(w.duration(), 0.5);
        assert!(w.is_silent());
        assert!(!Waveform::new(vec![0.0, 0.3], 16_000).is_silent());
        assert_eq!(Waveform::new(Vec::new(), 0).duration(), 0.0);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_waveform(Path::new("/nonexistent/track.wav"), 16_000).unwrap_err();
        assert!(matches!(err, DecodeError::Io(_)));
        let err = load_waveform(Path::new("/nonexistent/track.flac"), 16_000).unwrap_err();
        assert!(matches!(err, DecodeError::Io(_)));
    }

    #[test]
    fn test_garbage_is_probe_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.mp3");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(load_waveform(&path, 16_000).is_err());
    }
}
