//! Job states, failure records and the recovery policy

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shield_sdk::errors::{FailureClass, ShieldError, ShieldErrorExt};
use shield_sdk::manifest::Manifest;
use std::fmt;

use crate::planner::DiagnosticContext;
use crate::tools::Args;

/// Executor state machine
///
/// ```text
/// PLANNED -> EXECUTING -> VERIFYING -> COMMITTED
///                  ^          |
///                  |          +-> RETRYING -> EXECUTING
///                  |          +-> REPLANNING -> PLANNED
///                  +--------- any fatal -> ABORTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Planned,
    Executing,
    Verifying,
    Committed,
    Retrying,
    Replanning,
    Aborted,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "PLANNED",
            Self::Executing => "EXECUTING",
            Self::Verifying => "VERIFYING",
            Self::Committed => "COMMITTED",
            Self::Retrying => "RETRYING",
            Self::Replanning => "REPLANNING",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where inside a step an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStage {
    /// Tool lookup and argument resolution
    Prepare,
    Detect,
    VerifyDetection,
    Apply,
    Verify,
}

impl StepStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Detect => "detect",
            Self::VerifyDetection => "verify_detection",
            Self::Apply => "apply",
            Self::Verify => "verify",
        }
    }
}

/// One failed attempt of one step
#[derive(Debug)]
pub struct AttemptFailure {
    pub stage: StepStage,
    pub error: ShieldError,
    /// Verification details when a verdict failed
    pub metrics: Map<String, Value>,
}

impl AttemptFailure {
    pub fn new(stage: StepStage, error: ShieldError) -> Self {
        Self {
            stage,
            error,
            metrics: Map::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Map<String, Value>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// A step that failed for good, with everything a replan needs
#[derive(Debug)]
pub struct StepFailure {
    pub step: usize,
    pub tool: String,
    pub last: AttemptFailure,
    pub args_tried: Vec<Args>,
}

impl StepFailure {
    pub fn diagnostics(&self, manifest: &Manifest) -> DiagnosticContext {
        let reason = match self.last.metrics.get("reason").and_then(Value::as_str) {
            Some(r) => r.to_string(),
            None => self.last.error.to_string(),
        };
        DiagnosticContext {
            prior_manifest: manifest.clone(),
            step: self.step,
            tool: self.tool.clone(),
            stage: self.last.stage.as_str().to_string(),
            category: self.last.error.category().to_string(),
            reason,
            metrics: self.last.metrics.clone(),
            args_tried: self.args_tried.clone(),
        }
    }
}

/// What to do after an attempt fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Re-run the step with substituted arguments
    Retry,
    /// Hand the failure to the planner
    Replan,
    Abort,
}

/// Recovery for a failed attempt, given how many retries already ran
pub fn recovery_for(error: &ShieldError, retries_used: u32, max_retries: u32) -> Recovery {
    match error.class() {
        FailureClass::Fatal => Recovery::Abort,
        FailureClass::Escalate => Recovery::Replan,
        FailureClass::Retryable if retries_used < max_retries => Recovery::Retry,
        FailureClass::Retryable => Recovery::Replan,
    }
}

/// Successful job result
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    /// Committed artifact under the output directory
    pub output_path: std::path::PathBuf,
    pub summary: Map<String, Value>,
    /// The manifest that finally committed
    pub manifest: Manifest,
    pub replans: u32,
}

/// Structured terminal failure
///
/// Carries the failing stage, the error category and the diagnostics of
/// every replan on the way, never a partially processed output.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{category} during {stage}: {detail}")]
pub struct JobFailure {
    pub job_id: String,
    pub stage: String,
    pub category: String,
    pub detail: String,
    pub hint: String,
    pub diagnostics: Vec<DiagnosticContext>,
}

impl JobFailure {
    pub fn from_error(
        job_id: &str,
        stage: &str,
        error: &ShieldError,
        diagnostics: Vec<DiagnosticContext>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage: stage.to_string(),
            category: error.category().to_string(),
            detail: error.to_string(),
            hint: error.user_hint().to_string(),
            diagnostics,
        }
    }
}
