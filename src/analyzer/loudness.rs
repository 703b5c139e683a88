//! Loudness proxy: frame RMS on the pitch hop grid.

use super::spectrum::{centered_frame_count, centered_frames, pad_center};

/// RMS of each centered `frame_length` window every `hop` samples.
///
/// Yields `1 + len / hop` non-negative values, the same grid as the pitch contour.
pub fn rms_curve(samples: &[f32], frame_length: usize, hop: usize) -> Vec<f32> {
    if frame_length == 0 {
        return Vec::new();
    }
    let n_frames = centered_frame_count(samples.len(), hop);
    let padded = pad_center(samples, frame_length);
    centered_frames(&padded, frame_length, hop, n_frames)
        .map(|frame| {
            let mean_square = frame.iter().map(|x| x * x).sum::<f32>() / frame_length as f32;
            let rms = mean_square.sqrt();
            if rms.is_finite() { rms } else { 0.0 }
        })
        .collect()
}
