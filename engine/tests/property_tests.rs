use proptest::prelude::*;
use shield_engine::audio::{RedactionMode, RedactionSegment};
use shield_engine::config::{Config, VerificationConfig};
use shield_engine::verify::audio::{overlap_ratio, temporal_integrity};
use shield_engine::verify::video::{continuity, continuity_metrics};
use shield_engine::video::{BBox, FrameRecord, TrackLog, TrackObservation, TrackState};

/// One track whose last `predicted` frames are carried by prediction alone
fn fading_track(frames: usize, predicted: usize) -> TrackLog {
    TrackLog {
        fps: 30.0,
        width: 100,
        height: 100,
        frames: (0..frames)
            .map(|i| FrameRecord {
                index: i,
                tracks: vec![TrackObservation {
                    id: 7,
                    bbox: BBox::new(10.0, 10.0, 20.0, 20.0),
                    state: if i + predicted >= frames {
                        TrackState::Predicted
                    } else {
                        TrackState::Detected
                    },
                }],
            })
            .collect(),
    }
}

fn seg(start: f64, len: f64) -> RedactionSegment {
    RedactionSegment::new(start, start + len, RedactionMode::Beep)
}

#[test]
fn test_miss_ratio_at_threshold_fails() {
    let cfg = VerificationConfig::default();
    let at = continuity(&fading_track(10, 1), &cfg);
    assert!(!at.verified);
    assert!(at.reason().unwrap().contains("miss ratio"));
    assert!(continuity(&fading_track(11, 1), &cfg).verified);
}

#[test]
fn test_segment_limits_are_inclusive() {
    let cfg = Config::default().verification;
    assert!(temporal_integrity(&[seg(0.0, 15.0)], 20.0, &cfg).verified);
    assert!(!temporal_integrity(&[seg(0.0, 15.5)], 20.0, &cfg).verified);

    // Two of four segments overlap: exactly half still passes
    let half = [seg(0.0, 1.0), seg(0.5, 1.0), seg(3.0, 1.0), seg(5.0, 1.0)];
    assert_eq!(overlap_ratio(&half), 0.5);
    assert!(temporal_integrity(&half, 10.0, &cfg).verified);
}

proptest! {
    #[test]
    fn test_continuity_follows_miss_ratio(frames in 1usize..200, predicted_pct in 0usize..=100) {
        let predicted = frames * predicted_pct / 100;
        let log = fading_track(frames, predicted);
        let cfg = VerificationConfig::default();

        let m = continuity_metrics(&log, cfg.short_gap_secs);
        prop_assert_eq!(m.track_frames, frames);
        prop_assert_eq!(m.predicted_frames, predicted);
        // Unrecovered gaps never count as short gaps
        prop_assert_eq!(m.short_gap_frames, 0);

        let expected = (predicted as f64 / frames as f64) < cfg.max_miss_ratio;
        prop_assert_eq!(continuity(&log, &cfg).verified, expected);
    }

    #[test]
    fn test_disjoint_segments_within_clip_pass(
        lens in prop::collection::vec(0.05f64..15.0, 1..8)
    ) {
        let mut start = 0.0;
        let mut segments = Vec::new();
        for len in &lens {
            segments.push(seg(start, *len));
            start += len + 0.5;
        }
        let cfg = VerificationConfig::default();
        prop_assert_eq!(overlap_ratio(&segments), 0.0);
        prop_assert!(temporal_integrity(&segments, start, &cfg).verified);
    }

    #[test]
    fn test_inverted_segment_always_fails(start in 0.0f64..10.0, len in 0.0f64..5.0) {
        let inverted = RedactionSegment::new(start + len, start, RedactionMode::Silence);
        let cfg = VerificationConfig::default();
        prop_assert!(!temporal_integrity(&[inverted], 20.0, &cfg).verified);
    }

    #[test]
    fn test_overlap_ratio_is_a_fraction(
        spans in prop::collection::vec((0.0f64..10.0, 0.1f64..3.0), 0..10)
    ) {
        let segments: Vec<_> = spans.iter().map(|(s, l)| seg(*s, *l)).collect();
        let ratio = overlap_ratio(&segments);
        prop_assert!((0.0..=1.0).contains(&ratio));
    }
}
