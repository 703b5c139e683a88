//! Synthetic signals for unit tests.

use std::f32::consts::PI;

pub fn tone(freq: f32, secs: f32, sample_rate: u32) -> Vec<f32> {
    let n = (secs * sample_rate as f32) as usize;
    (0..n)
        .map(|i| 0.5 * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
        .collect()
}

pub fn silence(secs: f32, sample_rate: u32) -> Vec<f32> {
    vec![0.0; (secs * sample_rate as f32) as usize]
}

/// Short decaying 1 kHz bursts on every beat at `bpm`, starting at t = 0.
pub fn click_track(bpm: f32, secs: f32, sample_rate: u32) -> Vec<f32> {
    let mut out = silence(secs, sample_rate);
    add_clicks(&mut out, bpm, sample_rate, 0.8);
    out
}

/// 440 Hz tone with octave and fifth partials, plus 120 BPM accents.
pub fn tone_with_beats(secs: f32, sample_rate: u32) -> Vec<f32> {
    let sr = sample_rate as f32;
    let mut out: Vec<f32> = (0..(secs * sr) as usize)
        .map(|i| {
            let t = i as f32 / sr;
            0.5 * (2.0 * PI * 440.0 * t).sin()
                + 0.2 * (2.0 * PI * 880.0 * t).sin()
                + 0.1 * (2.0 * PI * 1320.0 * t).sin()
        })
        .collect();
    add_clicks(&mut out, 120.0, sample_rate, 0.6);
    out
}

fn add_clicks(out: &mut [f32], bpm: f32, sample_rate: u32, gain: f32) {
    let sr = sample_rate as f32;
    let period = (60.0 / bpm * sr) as usize;
    let burst = (0.02 * sr) as usize;
    let mut start = 0;
    while start < out.len() {
        for i in 0..burst.min(out.len() - start) {
            let t = i as f32 / sr;
            out[start + i] += gain * (-t * 200.0).exp() * (2.0 * PI * 1000.0 * t).sin();
        }
        start += period;
    }
}
