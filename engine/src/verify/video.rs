//! Video continuity and blur intensity checks

use serde_json::json;
use shield_sdk::types::VerifyOutput;
use std::collections::BTreeMap;

use crate::config::VerificationConfig;
use crate::video::blur::mean_region_sharpness;
use crate::video::{FrameSequence, TrackLog, TrackState, VideoError};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContinuityMetrics {
    /// Observations across all tracks and frames
    pub track_frames: usize,
    /// Observations carried by prediction alone
    pub predicted_frames: usize,
    /// Predicted frames in gaps shorter than the short-gap limit that recovered
    pub short_gap_frames: usize,
    pub miss_ratio: f64,
    pub short_gap_ratio: f64,
}

pub fn continuity_metrics(log: &TrackLog, short_gap_secs: f64) -> ContinuityMetrics {
    let mut per_track: BTreeMap<u64, Vec<TrackState>> = BTreeMap::new();
    for frame in &log.frames {
        for obs in &frame.tracks {
            per_track.entry(obs.id).or_default().push(obs.state);
        }
    }

    let fps = if log.fps > 0.0 { log.fps } else { 1.0 };
    let mut m = ContinuityMetrics::default();
    for states in per_track.values() {
        m.track_frames += states.len();
        let mut run = 0usize;
        for state in states {
            if *state == TrackState::Predicted {
                m.predicted_frames += 1;
                run += 1;
            } else {
                // Gap closed by fresh evidence
                if run > 0 && (run as f64 / fps) < short_gap_secs {
                    m.short_gap_frames += run;
                }
                run = 0;
            }
        }
    }

    if m.track_frames > 0 {
        m.miss_ratio = m.predicted_frames as f64 / m.track_frames as f64;
        m.short_gap_ratio = m.short_gap_frames as f64 / m.track_frames as f64;
    }
    m
}

/// Miss ratio and short-gap ratio must both stay below their limits
pub fn continuity(log: &TrackLog, cfg: &VerificationConfig) -> VerifyOutput {
    let m = continuity_metrics(log, cfg.short_gap_secs);
    let base = |out: VerifyOutput| {
        out.with_detail("miss_ratio", json!(m.miss_ratio))
            .with_detail("short_gap_ratio", json!(m.short_gap_ratio))
            .with_detail("track_frames", json!(m.track_frames))
            .with_detail("tracks", json!(log.track_count()))
    };

    if m.miss_ratio >= cfg.max_miss_ratio {
        return base(VerifyOutput::fail(format!(
            "miss ratio {:.3} not below {:.2}",
            m.miss_ratio, cfg.max_miss_ratio
        )));
    }
    if m.short_gap_ratio >= cfg.max_short_gap_ratio {
        return base(VerifyOutput::fail(format!(
            "short-gap ratio {:.3} not below {:.2}",
            m.short_gap_ratio, cfg.max_short_gap_ratio
        )));
    }
    base(VerifyOutput::pass())
}

/// Blurred regions must be soft enough on average
pub fn intensity(
    output: &FrameSequence,
    log: &TrackLog,
    blur_scale: f32,
    cfg: &VerificationConfig,
) -> Result<VerifyOutput, VideoError> {
    let Some(mean) = mean_region_sharpness(output, log, blur_scale)? else {
        return Ok(VerifyOutput::pass().with_detail("laplacian_variance", json!(null)));
    };
    let out = if (mean as f64) < cfg.max_laplacian_variance {
        VerifyOutput::pass()
    } else {
        VerifyOutput::fail(format!(
            "mean Laplacian variance {:.1} not below {:.1}",
            mean, cfg.max_laplacian_variance
        ))
    };
    Ok(out.with_detail("laplacian_variance", json!(mean)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{BBox, FrameRecord, TrackObservation};

    /// One track over `states.len()` frames
    fn log(states: &[TrackState], fps: f64) -> TrackLog {
        TrackLog {
            fps,
            width: 100,
            height: 100,
            frames: states
                .iter()
                .enumerate()
                .map(|(i, s)| FrameRecord {
                    index: i,
                    tracks: vec![TrackObservation {
                        id: 1,
                        bbox: BBox::new(10.0, 10.0, 20.0, 20.0),
                        state: *s,
                    }],
                })
                .collect(),
        }
    }

    fn states(predicted_at: &[usize], n: usize) -> Vec<TrackState> {
        (0..n)
            .map(|i| {
                if predicted_at.contains(&i) {
                    TrackState::Predicted
                } else {
                    TrackState::Detected
                }
            })
            .collect()
    }

    #[test]
    fn test_miss_ratio_boundary_is_exclusive() {
        // 10 of 100 frames predicted in one long unrecovered run
        let s = states(&(90..100).collect::<Vec<_>>(), 100);
        let out = continuity(&log(&s, 1.0), &VerificationConfig::default());
        assert!(!out.verified);
        assert_eq!(out.details["miss_ratio"], json!(0.1));

        let s = states(&(91..100).collect::<Vec<_>>(), 100);
        assert!(continuity(&log(&s, 1.0), &VerificationConfig::default()).verified);
    }

    #[test]
    fn test_short_recovered_gaps_counted() {
        // At 30 fps, two-frame gaps are short; five gaps of two over 100 frames
        let gaps: Vec<usize> = [10, 11, 30, 31, 50, 51, 70, 71, 90, 91].to_vec();
        let m = continuity_metrics(&log(&states(&gaps, 100), 30.0), 0.5);
        assert_eq!(m.short_gap_frames, 10);
        assert!((m.short_gap_ratio - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_long_or_unrecovered_gaps_not_short() {
        // 20-frame gap at 30 fps is 0.67s, trailing gap never recovers
        let mut predicted: Vec<usize> = (10..30).collect();
        predicted.extend([98, 99]);
        let m = continuity_metrics(&log(&states(&predicted, 100), 30.0), 0.5);
        assert_eq!(m.short_gap_frames, 0);
        assert_eq!(m.predicted_frames, 22);
    }

    #[test]
    fn test_empty_log_passes() {
        let out = continuity(&TrackLog::default(), &VerificationConfig::default());
        assert!(out.verified);
    }
}
