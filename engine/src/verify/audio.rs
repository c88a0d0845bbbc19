//! Audio temporal integrity and compliance checks

use serde_json::json;
use shield_sdk::types::VerifyOutput;

use super::{CATEGORY_KEY, TEMPORAL_INTEGRITY};
use crate::audio::localize::phrases_found;
use crate::audio::{AudioClip, AudioError, RedactionSegment, Transcriber};
use crate::config::VerificationConfig;

/// Slack for float rounding at the clip end
const END_TOLERANCE: f64 = 1e-6;

/// Fraction of segments that overlap or duplicate another
pub fn overlap_ratio(segments: &[RedactionSegment]) -> f64 {
    if segments.is_empty() {
        return 0.0;
    }
    let flagged = segments
        .iter()
        .enumerate()
        .filter(|(i, a)| {
            segments
                .iter()
                .enumerate()
                .any(|(j, b)| *i != j && (a.overlaps(b) || *a == b))
        })
        .count();
    flagged as f64 / segments.len() as f64
}

/// Ordering, bounds, plausibility and overlap of a segment set
pub fn temporal_integrity(
    segments: &[RedactionSegment],
    duration: f64,
    cfg: &VerificationConfig,
) -> VerifyOutput {
    let fail = |reason: String| {
        VerifyOutput::fail(reason).with_detail(CATEGORY_KEY, json!(TEMPORAL_INTEGRITY))
    };

    for (i, s) in segments.iter().enumerate() {
        if !(s.start_time >= 0.0 && s.start_time < s.end_time) {
            return fail(format!(
                "segment {} has start {} not before end {}",
                i, s.start_time, s.end_time
            ));
        }
        if s.end_time > duration + END_TOLERANCE {
            return fail(format!(
                "segment {} ends at {} past clip duration {}",
                i, s.end_time, duration
            ));
        }
        if s.duration() > cfg.max_segment_secs {
            return fail(format!(
                "segment {} lasts {:.1}s, longer than {:.1}s",
                i,
                s.duration(),
                cfg.max_segment_secs
            ));
        }
    }

    let ratio = overlap_ratio(segments);
    let out = if ratio > cfg.max_overlap_ratio {
        fail(format!(
            "{:.0}% of segments overlap or repeat",
            ratio * 100.0
        ))
    } else {
        VerifyOutput::pass()
    };
    out.with_detail("segments", json!(segments.len()))
        .with_detail("overlap_ratio", json!(ratio))
}

/// Re-transcribe the redacted clip; no sensitive phrase may survive
pub fn compliance(
    redacted: &AudioClip,
    transcriber: &dyn Transcriber,
    phrases: &[String],
    fuzzy_threshold: f64,
) -> Result<VerifyOutput, AudioError> {
    if phrases.is_empty() {
        return Ok(VerifyOutput::pass().with_detail("phrases", json!(0)));
    }
    let words = transcriber.transcribe(redacted)?;
    let survivors = phrases_found(&words, phrases, fuzzy_threshold);
    let out = if survivors.is_empty() {
        VerifyOutput::pass()
    } else {
        VerifyOutput::fail(format!(
            "{} sensitive phrase(s) still recognizable",
            survivors.len()
        ))
        .with_detail("still_present", json!(survivors))
    };
    Ok(out.with_detail("phrases", json!(phrases.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RedactionMode;
    use proptest::prelude::*;

    fn seg(a: f64, b: f64) -> RedactionSegment {
        RedactionSegment::new(a, b, RedactionMode::Beep)
    }

    #[test]
    fn test_valid_set_passes() {
        let out = temporal_integrity(&[seg(0.0, 1.0), seg(2.0, 3.0)], 5.0, &Default::default());
        assert!(out.verified);
        assert!(temporal_integrity(&[], 5.0, &Default::default()).verified);
    }

    #[test]
    fn test_inverted_and_out_of_bounds_fail() {
        let cfg = VerificationConfig::default();
        assert!(!temporal_integrity(&[seg(2.0, 1.0)], 5.0, &cfg).verified);
        assert!(!temporal_integrity(&[seg(1.0, 1.0)], 5.0, &cfg).verified);
        let out = temporal_integrity(&[seg(4.0, 5.5)], 5.0, &cfg);
        assert!(!out.verified);
        assert_eq!(out.details[CATEGORY_KEY], json!(TEMPORAL_INTEGRITY));
    }

    #[test]
    fn test_long_segment_fails() {
        let cfg = VerificationConfig::default();
        assert!(temporal_integrity(&[seg(0.0, 15.0)], 60.0, &cfg).verified);
        assert!(!temporal_integrity(&[seg(0.0, 15.5)], 60.0, &cfg).verified);
    }

    #[test]
    fn test_overlap_majority_fails() {
        let cfg = VerificationConfig::default();
        // Two of four overlap: exactly half is tolerated
        let half = [seg(0.0, 1.0), seg(0.5, 1.5), seg(3.0, 4.0), seg(5.0, 6.0)];
        assert!(temporal_integrity(&half, 10.0, &cfg).verified);
        let dupes = [seg(0.0, 1.0), seg(0.0, 1.0), seg(5.0, 6.0)];
        assert!(!temporal_integrity(&dupes, 10.0, &cfg).verified);
    }

    proptest! {
        #[test]
        fn prop_disjoint_sorted_segments_pass(
            gaps in prop::collection::vec((0.01f64..2.0, 0.01f64..5.0), 0..30)
        ) {
            let mut t = 0.0;
            let mut segs = Vec::new();
            for (gap, len) in gaps {
                let start = t + gap;
                segs.push(seg(start, start + len));
                t = start + len;
            }
            let out = temporal_integrity(&segs, t + 1.0, &VerificationConfig::default());
            prop_assert!(out.verified);
            prop_assert_eq!(overlap_ratio(&segs), 0.0);
        }
    }
}
