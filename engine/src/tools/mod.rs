//! Privacy tools
//!
//! Every pipeline step runs a `PrivacyTool`. A tool has an optional detection
//! phase whose output is verified before the transform phase is allowed to
//! run, then a transform (`apply`) whose output is verified before the step is
//! committed. Built-in tools drive the video and audio engines; generated
//! tools run out of process behind the same trait.

use async_trait::async_trait;
use serde_json::{Map, Value};
use shield_sdk::errors::ShieldError;
use shield_sdk::tool_spec::ToolSpec;
use shield_sdk::types::{ApplyOutput, VerifyOutput};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::audio::{SpeechDetection, Transcriber};
use crate::config::Config;
use crate::llm::LLMProvider;
use crate::video::{FaceDetector, TrackLog};

pub mod audio_tools;
pub mod video_tools;

pub use audio_tools::{DetectKeywords, MuteKeywords, MuteSegments};
pub use video_tools::{Blur, BlurFaces, DetectFaces};

/// Step arguments
pub type Args = Map<String, Value>;

/// Per-attempt execution context handed to a tool
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: String,
    pub step_index: usize,
    /// 0 for the first run, incremented per local retry
    pub attempt: u32,
    /// Staging directory; outputs outside it are rejected
    pub output_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl StageContext {
    /// Context for running a tool outside the executor
    pub fn for_test(output_dir: &Path) -> Self {
        Self {
            job_id: "test".to_string(),
            step_index: 0,
            attempt: 0,
            output_dir: output_dir.to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    /// Fail fast once the job has been cancelled
    pub fn check_cancelled(&self) -> Result<(), ShieldError> {
        if self.cancel.is_cancelled() {
            Err(ShieldError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Output of a detection phase
#[derive(Debug, Clone)]
pub enum Detection {
    /// Per-frame face tracks
    Faces(TrackLog),
    /// Transcript, sensitive phrases and their localized segments
    Speech(SpeechDetection),
    /// Opaque result of an external detector
    External(ApplyOutput),
}

/// The two-phase tool contract
#[async_trait]
pub trait PrivacyTool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Detection phase; tools without one return `None`
    async fn detect(
        &self,
        _ctx: &StageContext,
        _args: &Args,
    ) -> Result<Option<Detection>, ShieldError> {
        Ok(None)
    }

    /// Score a detection before any transform may consume it
    fn verify_detection(&self, detection: &Detection) -> VerifyOutput {
        match detection {
            Detection::External(out) => match out.summary.get("verified") {
                Some(Value::Bool(false)) => VerifyOutput::fail("external detector reported failure"),
                _ => VerifyOutput::pass(),
            },
            _ => VerifyOutput::pass(),
        }
    }

    /// Transform phase
    async fn apply(
        &self,
        ctx: &StageContext,
        args: &Args,
        detection: Option<&Detection>,
    ) -> Result<ApplyOutput, ShieldError>;

    /// Score the transform output
    async fn verify(
        &self,
        ctx: &StageContext,
        args: &Args,
        output: &ApplyOutput,
        detection: Option<&Detection>,
    ) -> Result<VerifyOutput, ShieldError>;

    /// Adjusted arguments for a local retry
    ///
    /// `attempt` is the retry about to run (1 for the first retry) and
    /// `failure` is what sank the previous attempt.
    fn substitute(&self, args: &Args, _attempt: u32, _failure: &ShieldError) -> Args {
        args.clone()
    }
}

/// Collaborators the built-in tools are constructed with
#[derive(Clone)]
pub struct ToolDeps {
    pub config: Arc<Config>,
    pub llm: Arc<dyn LLMProvider>,
    pub detector: Arc<dyn FaceDetector>,
    pub transcriber: Arc<dyn Transcriber>,
}

/// The built-in catalogue
pub fn builtin_tools(deps: &ToolDeps) -> Vec<Arc<dyn PrivacyTool>> {
    vec![
        Arc::new(DetectFaces::new(deps.clone())),
        Arc::new(Blur::new(deps.clone())),
        Arc::new(BlurFaces::new(deps.clone())),
        Arc::new(DetectKeywords::new(deps.clone())),
        Arc::new(MuteSegments::new(deps.clone())),
        Arc::new(MuteKeywords::new(deps.clone())),
    ]
}

/// Run CPU-heavy work off the async runtime
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ShieldError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ShieldError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ShieldError::ToolExecution(format!("worker panicked: {}", e)))?
}

/// One recorded call into a `ScriptedTool`
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedCall {
    pub phase: &'static str,
    pub attempt: u32,
    pub args: Args,
}

/// Deterministic tool for exercising the executor
///
/// Detection and transform verdicts are popped from queues; an empty queue
/// passes. `apply` writes the received arguments as JSON into the staging
/// directory.
pub struct ScriptedTool {
    spec: ToolSpec,
    has_detection: bool,
    detection_verdicts: Mutex<VecDeque<bool>>,
    verify_verdicts: Mutex<VecDeque<bool>>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedTool {
    pub fn new(spec: ToolSpec) -> Self {
        Self {
            spec,
            has_detection: false,
            detection_verdicts: Mutex::new(VecDeque::new()),
            verify_verdicts: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Enable the detection phase with the given verdicts
    pub fn with_detection(mut self, verdicts: impl IntoIterator<Item = bool>) -> Self {
        self.has_detection = true;
        self.detection_verdicts = Mutex::new(verdicts.into_iter().collect());
        self
    }

    pub fn with_verdicts(self, verdicts: impl IntoIterator<Item = bool>) -> Self {
        Self {
            verify_verdicts: Mutex::new(verdicts.into_iter().collect()),
            ..self
        }
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls made in `phase`
    pub fn count(&self, phase: &str) -> usize {
        self.calls().iter().filter(|c| c.phase == phase).count()
    }

    fn record(&self, phase: &'static str, ctx: &StageContext, args: &Args) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ScriptedCall {
                phase,
                attempt: ctx.attempt,
                args: args.clone(),
            });
        }
    }

    fn pop(queue: &Mutex<VecDeque<bool>>) -> bool {
        queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(true)
    }
}

#[async_trait]
impl PrivacyTool for ScriptedTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn detect(
        &self,
        ctx: &StageContext,
        args: &Args,
    ) -> Result<Option<Detection>, ShieldError> {
        if !self.has_detection {
            return Ok(None);
        }
        self.record("detect", ctx, args);
        let verified = Self::pop(&self.detection_verdicts);
        Ok(Some(Detection::External(
            ApplyOutput::new(ctx.output_dir.join("detections.json"))
                .with_summary("verified", Value::Bool(verified))
                .with_summary("miss_ratio", serde_json::json!(if verified { 0.0 } else { 0.25 })),
        )))
    }

    async fn apply(
        &self,
        ctx: &StageContext,
        args: &Args,
        _detection: Option<&Detection>,
    ) -> Result<ApplyOutput, ShieldError> {
        self.record("apply", ctx, args);
        std::fs::create_dir_all(&ctx.output_dir)?;
        let path = ctx.output_dir.join(format!("{}.out", self.spec.name));
        std::fs::write(&path, Value::Object(args.clone()).to_string())?;
        Ok(ApplyOutput::new(path).with_summary("tool", Value::String(self.spec.name.clone())))
    }

    async fn verify(
        &self,
        ctx: &StageContext,
        args: &Args,
        _output: &ApplyOutput,
        _detection: Option<&Detection>,
    ) -> Result<VerifyOutput, ShieldError> {
        self.record("verify", ctx, args);
        if Self::pop(&self.verify_verdicts) {
            Ok(VerifyOutput::pass())
        } else {
            Ok(VerifyOutput::fail("scripted verification failure"))
        }
    }
}
