//! Verification Module
//!
//! Pure scoring of a stage's output against fixed thresholds. Every check
//! returns a `VerifyOutput` whose details carry the measured metrics, so a
//! failure can be surfaced as diagnostics for retry and replanning.

use serde_json::Value;
use shield_sdk::errors::ShieldError;
use shield_sdk::types::VerifyOutput;

pub mod audio;
pub mod video;

pub use audio::{compliance, temporal_integrity};
pub use video::{continuity, intensity};

/// Detail key naming the failure category
pub const CATEGORY_KEY: &str = "category";
pub const TEMPORAL_INTEGRITY: &str = "TemporalIntegrityError";

/// Which side of a step a verdict belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Detection,
    Transform,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Detection => "detection",
            Phase::Transform => "transform",
        }
    }
}

/// Error for a failed verdict
pub fn verification_error(phase: Phase, tool: &str, out: &VerifyOutput) -> ShieldError {
    let reason = format!(
        "{}: {}",
        tool,
        out.reason().unwrap_or("verification failed")
    );
    let category = out.details.get(CATEGORY_KEY).and_then(Value::as_str);
    match (phase, category) {
        (_, Some(TEMPORAL_INTEGRITY)) => ShieldError::TemporalIntegrityError(reason),
        (Phase::Detection, _) => ShieldError::DetectionVerificationFailure(reason),
        (Phase::Transform, _) => ShieldError::RedactionVerificationFailure(reason),
    }
}

/// Merge `other` into `out`, failing if either failed
pub fn combine(mut out: VerifyOutput, other: VerifyOutput) -> VerifyOutput {
    let reason = match (out.verified, other.verified) {
        (true, false) => other.reason().map(str::to_string),
        _ => None,
    };
    out.verified &= other.verified;
    for (k, v) in other.details {
        if k == "reason" && reason.is_none() {
            continue;
        }
        out.details.entry(k).or_insert(v);
    }
    if let Some(r) = reason {
        out.details.insert("reason".to_string(), Value::String(r));
    }
    out
}
