//! Realizing redaction segments on samples

use std::f32::consts::TAU;

use super::{AudioClip, RedactionMode, RedactionSegment};

/// 20 dB below full scale
pub const OFFLINE_BEEP_AMPLITUDE: f32 = 0.1;
pub const LIVE_BEEP_AMPLITUDE: f32 = 0.6;

#[derive(Debug, Clone, Copy)]
pub struct Tone {
    pub hz: f32,
    pub amplitude: f32,
}

impl Tone {
    pub fn offline(hz: f32) -> Self {
        Self {
            hz,
            amplitude: OFFLINE_BEEP_AMPLITUDE,
        }
    }

    pub fn live(hz: f32) -> Self {
        Self {
            hz,
            amplitude: LIVE_BEEP_AMPLITUDE,
        }
    }

    fn sample_at(&self, secs: f64) -> f32 {
        self.amplitude * (TAU * self.hz * secs as f32).sin()
    }
}

/// Extend each segment's end by `pad_secs`, clamped to `duration`
pub fn pad_segments(
    segments: &[RedactionSegment],
    pad_secs: f64,
    duration: f64,
) -> Vec<RedactionSegment> {
    segments
        .iter()
        .map(|s| RedactionSegment {
            end_time: (s.end_time + pad_secs).min(duration),
            ..*s
        })
        .collect()
}

/// Overwrite the part of `samples` that falls inside `segment`
///
/// `samples` is an interleaved buffer starting `offset_secs` into the stream,
/// so the same routine serves whole clips and live chunks. The tone phase is
/// tied to stream time.
pub fn fill_segment(
    samples: &mut [f32],
    channels: usize,
    sample_rate: u32,
    offset_secs: f64,
    segment: &RedactionSegment,
    tone: Tone,
) {
    if segment.mode == RedactionMode::None {
        return;
    }
    let channels = channels.max(1);
    let rate = sample_rate as f64;
    let frames = samples.len() / channels;
    let to_frame = |t: f64| (((t - offset_secs) * rate).round().max(0.0) as usize).min(frames);
    let start = to_frame(segment.start_time);
    let end = to_frame(segment.end_time);

    for frame in start..end {
        let value = match segment.mode {
            RedactionMode::Beep => tone.sample_at(offset_secs + frame as f64 / rate),
            _ => 0.0,
        };
        for c in 0..channels {
            samples[frame * channels + c] = value;
        }
    }
}

pub fn apply_segments(clip: &mut AudioClip, segments: &[RedactionSegment], tone: Tone) {
    let channels = clip.channels();
    let rate = clip.sample_rate();
    for seg in segments {
        fill_segment(&mut clip.samples, channels, rate, 0.0, seg, tone);
    }
}
