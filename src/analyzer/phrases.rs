//! Phrase segmentation from onsets, with a beat-grid fallback.

use serde::{Deserialize, Serialize};

/// A time span of the track, `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Phrase {
    pub start: f32,
    pub end: f32,
}

/// Split the track at onsets that lie more than `gap` seconds past the
/// current phrase start; onsets closer than that are absorbed.
///
/// When no onset-driven phrase results and there are at least two beats,
/// the beat grid is grouped into windows of `beats_per_phrase` beats instead.
pub fn segment(onsets: &[f32], beats: &[f32], gap: f32, beats_per_phrase: usize) -> Vec<Phrase> {
    let mut phrases = Vec::new();
    let mut cur = 0.0f32;
    for &t in onsets {
        if t - cur > gap {
            phrases.push(Phrase { start: cur, end: t });
            cur = t;
        }
    }

    if phrases.is_empty() && beats.len() > 1 {
        phrases = from_beats(beats, beats_per_phrase);
        log::debug!("No onset phrases, {} phrases from {} beats", phrases.len(), beats.len());
    }
    phrases
}

/// Windows `[beat[i], beat[i + step]]` for `i = 0, step, 2*step, ...` while
/// `i + step` is a valid beat index. With too few beats for a full window,
/// a single phrase spans the first to the last beat.
fn from_beats(beats: &[f32], step: usize) -> Vec<Phrase> {
    let step = step.max(1);
    let last = beats.len().saturating_sub(1);
    if last == 0 {
        return Vec::new();
    }
    if step > last {
        return span(beats[0], beats[last]).into_iter().collect();
    }
    (0..)
        .step_by(step)
        .take_while(|i| i + step <= last)
        .filter_map(|i| span(beats[i], beats[i + step]))
        .collect()
}

fn span(start: f32, end: f32) -> Option<Phrase> {
    (start < end).then_some(Phrase { start, end })
}
