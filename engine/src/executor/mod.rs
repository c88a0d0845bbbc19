//! Executor / Closed-Loop Recovery
//!
//! Runs a manifest step by step. Each step goes through detection, detection
//! verification, transform and transform verification; a transform never
//! runs on unverified detections. A failed attempt is retried with the
//! tool's substitute arguments up to `max_retries`, then the whole job is
//! handed back to the planner with diagnostics, up to `max_replans` times.
//! Fatal errors abort immediately.
//!
//! Step outputs are staged under `work_dir/<job>/run<N>/step<i>/attempt<k>` and
//! only the final artifact is committed to `output_dir/<job>/`. Nothing is
//! committed for a failed or cancelled job.

use serde_json::{json, Map, Value};
use shield_sdk::audit::{AuditEntry, AuditStage};
use shield_sdk::errors::{FailureClass, ShieldError, ShieldErrorExt};
use shield_sdk::manifest::Manifest;
use shield_sdk::tool_spec::ToolSpec;
use shield_sdk::types::{ApplyOutput, MediaKind};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::AuditSink;
use crate::config::Config;
use crate::planner::{DiagnosticContext, Planner};
use crate::registry::ToolRegistry;
use crate::tools::{run_blocking, Args, PrivacyTool, StageContext};
use crate::verify::{verification_error, Phase};

pub mod recovery;

pub use recovery::{
    recovery_for, AttemptFailure, JobFailure, JobOutcome, JobState, Recovery, StepFailure,
    StepStage,
};

const PREV_PREFIX: &str = "$prev.";

/// One request against one input file
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub user_text: String,
    pub input: PathBuf,
    pub cancel: CancellationToken,
}

impl Job {
    pub fn new(user_text: impl Into<String>, input: impl Into<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_text: user_text.into(),
            input: input.into(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Bounds and locations the executor runs with
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_retries: u32,
    pub max_replans: u32,
    pub stage_timeout: Duration,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl From<&Config> for ExecutorSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.executor.max_retries,
            max_replans: config.executor.max_replans,
            stage_timeout: Duration::from_secs(config.executor.stage_timeout_secs),
            work_dir: config.core.work_dir.clone(),
            output_dir: config.core.output_dir.clone(),
        }
    }
}

/// Outputs committed so far in one run of a manifest
#[derive(Default)]
struct RunState {
    prev: Option<ApplyOutput>,
    /// Latest media artifact per kind, fed to later steps
    media: HashMap<MediaKind, PathBuf>,
    steps: Vec<Value>,
}

pub struct Executor {
    registry: Arc<ToolRegistry>,
    planner: Arc<Planner>,
    audit: Arc<dyn AuditSink>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        planner: Arc<Planner>,
        audit: Arc<dyn AuditSink>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            registry,
            planner,
            audit,
            settings,
        }
    }

    /// Drive `manifest` to a committed output or a structured failure
    pub async fn execute(&self, job: &Job, manifest: Manifest) -> Result<JobOutcome, JobFailure> {
        let mut manifest = manifest;
        let mut replans = 0u32;
        let mut trail: Vec<DiagnosticContext> = Vec::new();
        self.transition(job, JobState::Planned);

        if !job.input.exists() {
            let error = ShieldError::MissingInput(job.input.clone());
            return Err(self.abort(job, "input", &error, trail));
        }

        let outcome = loop {
            match self.run_manifest(job, &manifest, replans).await {
                Ok(state) => break state,
                Err(failure) => {
                    let error = &failure.last.error;
                    if error.class() == FailureClass::Fatal {
                        return Err(self.abort(job, failure.last.stage.as_str(), error, trail));
                    }
                    let diag = failure.diagnostics(&manifest);
                    trail.push(diag.clone());

                    if replans >= self.settings.max_replans {
                        let exhausted = ShieldError::ReplansExhausted(replans);
                        warn!(job = %job.id, replans, last = %error, "Replan limit reached");
                        return Err(self.abort(job, failure.last.stage.as_str(), &exhausted, trail));
                    }

                    replans += 1;
                    self.transition(job, JobState::Replanning);
                    self.audit.append(
                        AuditEntry::fail(
                            AuditStage::Recover,
                            format!("replan {} after {} failed in {}: {}", replans, failure.tool, diag.stage, error),
                        )
                        .for_job(&job.id),
                    );

                    let replanned = tokio::select! {
                        _ = job.cancel.cancelled() => Err(ShieldError::Cancelled),
                        r = self.planner.plan(&job.user_text, Some(&diag)) => r,
                    };
                    manifest = match replanned {
                        Ok(m) => m,
                        Err(e) => return Err(self.abort(job, "plan", &e, trail)),
                    };
                    self.transition(job, JobState::Planned);
                }
            }
        };

        match self.commit(job, outcome).await {
            Ok((output_path, steps)) => {
                self.transition(job, JobState::Committed);
                self.audit.append(
                    AuditEntry::ok(
                        AuditStage::Execute,
                        format!("committed {}", output_path.display()),
                    )
                    .for_job(&job.id),
                );
                let mut summary = steps
                    .last()
                    .and_then(|s| s.get("summary"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                summary.insert("steps".to_string(), Value::Array(steps));
                summary.insert("replans".to_string(), json!(replans));
                Ok(JobOutcome {
                    job_id: job.id.clone(),
                    output_path,
                    summary,
                    manifest,
                    replans,
                })
            }
            Err(e) => Err(self.abort(job, "commit", &e, trail)),
        }
    }

    /// One pass over the manifest; stops at the first step that fails for good
    async fn run_manifest(
        &self,
        job: &Job,
        manifest: &Manifest,
        run: u32,
    ) -> Result<RunState, StepFailure> {
        let whole = |error: ShieldError| StepFailure {
            step: 0,
            tool: String::new(),
            last: AttemptFailure::new(StepStage::Prepare, error),
            args_tried: Vec::new(),
        };
        manifest.validate().map_err(whole)?;

        let mut state = RunState::default();
        if let Some(kind) = MediaKind::from_path(&job.input) {
            state.media.insert(kind, job.input.clone());
        }

        for (index, step) in manifest.pipeline.iter().enumerate() {
            let failed = |error: ShieldError| StepFailure {
                step: index,
                tool: step.tool.clone(),
                last: AttemptFailure::new(StepStage::Prepare, error),
                args_tried: Vec::new(),
            };
            if job.cancel.is_cancelled() {
                return Err(failed(ShieldError::Cancelled));
            }

            // Only registered tools ever run
            let Some(tool) = self.registry.get(&step.tool) else {
                return Err(failed(ShieldError::ToolNotFound(step.tool.clone())));
            };
            let spec = tool.spec();
            let args = prepare_args(&step.args, &spec, &state, &job.user_text).map_err(failed)?;

            let step_dir = self
                .settings
                .work_dir
                .join(&job.id)
                .join(format!("run{}", run))
                .join(format!("step{}", index));
            let output = self.run_step(job, index, tool, args, &step_dir).await?;

            if let Some(kind) = media_kind_of(&output.output_path) {
                state.media.insert(kind, output.output_path.clone());
            }
            state.steps.push(json!({
                "tool": step.tool,
                "output_path": output.output_path.to_string_lossy(),
                "summary": Value::Object(output.summary.clone()),
            }));
            state.prev = Some(output);
        }
        Ok(state)
    }

    /// Attempts of one step, with local retries
    async fn run_step(
        &self,
        job: &Job,
        index: usize,
        tool: Arc<dyn PrivacyTool>,
        args: Args,
        step_dir: &Path,
    ) -> Result<ApplyOutput, StepFailure> {
        let name = tool.spec().name;
        let mut args = args;
        let mut args_tried = Vec::new();
        let mut attempt = 0u32;

        loop {
            args_tried.push(args.clone());
            let ctx = StageContext {
                job_id: job.id.clone(),
                step_index: index,
                attempt,
                output_dir: step_dir.join(format!("attempt{}", attempt)),
                cancel: job.cancel.child_token(),
            };

            let failure = match self.attempt(tool.as_ref(), &ctx, &args).await {
                Ok(output) => {
                    self.audit.append(
                        AuditEntry::ok(AuditStage::Execute, format!("step {} {} passed", index, name))
                            .for_job(&job.id),
                    );
                    return Ok(output);
                }
                Err(failure) => failure,
            };

            warn!(
                job = %job.id,
                step = index,
                tool = %name,
                attempt,
                stage = failure.stage.as_str(),
                error = %failure.error,
                "Step attempt failed"
            );
            self.audit.append(
                AuditEntry::fail(
                    AuditStage::Execute,
                    format!("step {} {} attempt {} failed in {}: {}", index, name, attempt, failure.stage.as_str(), failure.error),
                )
                .for_job(&job.id),
            );

            if recovery_for(&failure.error, attempt, self.settings.max_retries) != Recovery::Retry {
                return Err(StepFailure {
                    step: index,
                    tool: name,
                    last: failure,
                    args_tried,
                });
            }

            attempt += 1;
            self.transition(job, JobState::Retrying);
            args = tool.substitute(&args, attempt, &failure.error);
            self.audit.append(
                AuditEntry::ok(
                    AuditStage::Recover,
                    format!("retry {} of {} with {}", attempt, name, Value::Object(args.clone())),
                )
                .for_job(&job.id),
            );
        }
    }

    /// detect -> verify detection -> apply -> verify
    async fn attempt(
        &self,
        tool: &dyn PrivacyTool,
        ctx: &StageContext,
        args: &Args,
    ) -> Result<ApplyOutput, AttemptFailure> {
        let name = tool.spec().name;
        self.transition_ctx(ctx, JobState::Executing);

        let detection = self
            .phase(ctx, "detect", tool.detect(ctx, args))
            .await
            .map_err(|e| AttemptFailure::new(StepStage::Detect, e))?;

        if let Some(detection) = &detection {
            self.transition_ctx(ctx, JobState::Verifying);
            let verdict = tool.verify_detection(detection);
            self.audit_verdict(ctx, &name, Phase::Detection, verdict.verified, &verdict.details);
            if !verdict.verified {
                let error = verification_error(Phase::Detection, &name, &verdict);
                return Err(AttemptFailure::new(StepStage::VerifyDetection, error).with_metrics(verdict.details));
            }
            self.transition_ctx(ctx, JobState::Executing);
        }

        let output = self
            .phase(ctx, "apply", tool.apply(ctx, args, detection.as_ref()))
            .await
            .map_err(|e| AttemptFailure::new(StepStage::Apply, e))?;

        self.transition_ctx(ctx, JobState::Verifying);
        let verdict = self
            .phase(ctx, "verify", tool.verify(ctx, args, &output, detection.as_ref()))
            .await
            .map_err(|e| AttemptFailure::new(StepStage::Verify, e))?;
        self.audit_verdict(ctx, &name, Phase::Transform, verdict.verified, &verdict.details);
        if !verdict.verified {
            let error = verification_error(Phase::Transform, &name, &verdict);
            return Err(AttemptFailure::new(StepStage::Verify, error).with_metrics(verdict.details));
        }
        Ok(output)
    }

    /// Run one phase under the stage timeout, racing cancellation
    async fn phase<T, F>(&self, ctx: &StageContext, stage: &str, fut: F) -> Result<T, ShieldError>
    where
        F: Future<Output = Result<T, ShieldError>>,
    {
        let timeout = self.settings.stage_timeout;
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ShieldError::Cancelled),
            r = tokio::time::timeout(timeout, fut) => match r {
                Ok(inner) => inner,
                Err(_) => {
                    // Stops frame loops still running on the blocking pool
                    ctx.cancel.cancel();
                    Err(ShieldError::ExecutionTimeout {
                        stage: stage.to_string(),
                        secs: timeout.as_secs(),
                    })
                }
            },
        }
    }

    /// Copy the final artifact to `output_dir/<job>/` and drop the staging area
    async fn commit(&self, job: &Job, state: RunState) -> Result<(PathBuf, Vec<Value>), ShieldError> {
        let last_output = state
            .prev
            .as_ref()
            .map(|o| o.output_path.clone())
            .ok_or_else(|| ShieldError::MalformedManifest("pipeline produced no output".to_string()))?;
        // The last media artifact wins over side outputs like track logs
        let artifact = last_media(&state).unwrap_or(last_output);

        let job_dir = self.settings.output_dir.join(&job.id);
        let work_root = self.settings.work_dir.join(&job.id);
        let record = json!({
            "job_id": job.id,
            "request": job.user_text,
            "steps": state.steps,
        });

        let committed = run_blocking(move || {
            std::fs::create_dir_all(&job_dir)?;
            let name = artifact
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "output".into());
            let target = job_dir.join(name);
            copy_recursive(&artifact, &target)?;
            let record_text = serde_json::to_string_pretty(&record)
                .map_err(|e| ShieldError::ToolExecution(format!("record encoding: {}", e)))?;
            std::fs::write(job_dir.join("record.json"), record_text)?;
            if let Err(e) = std::fs::remove_dir_all(&work_root) {
                debug!(error = %e, "Staging area already gone");
            }
            Ok(target)
        })
        .await?;

        Ok((committed, state.steps))
    }

    fn abort(
        &self,
        job: &Job,
        stage: &str,
        error: &ShieldError,
        trail: Vec<DiagnosticContext>,
    ) -> JobFailure {
        self.transition(job, JobState::Aborted);
        let detail = if matches!(error, ShieldError::Cancelled) {
            "cancelled; nothing committed".to_string()
        } else {
            format!("aborted in {}: {}", stage, error)
        };
        self.audit
            .append(AuditEntry::fail(AuditStage::Execute, detail).for_job(&job.id));
        let work_root = self.settings.work_dir.join(&job.id);
        if work_root.exists() {
            if let Err(e) = std::fs::remove_dir_all(&work_root) {
                warn!(job = %job.id, error = %e, "Failed to discard staging area");
            }
        }
        JobFailure::from_error(&job.id, stage, error, trail)
    }

    fn audit_verdict(&self, ctx: &StageContext, tool: &str, phase: Phase, ok: bool, details: &Map<String, Value>) {
        let detail = format!("{} {} {}", tool, phase.as_str(), Value::Object(details.clone()));
        let entry = if ok {
            AuditEntry::ok(AuditStage::Verify, detail)
        } else {
            AuditEntry::fail(AuditStage::Verify, detail)
        };
        self.audit.append(entry.for_job(&ctx.job_id));
    }

    fn transition(&self, job: &Job, state: JobState) {
        info!(job = %job.id, state = %state, "Job state");
    }

    fn transition_ctx(&self, ctx: &StageContext, state: JobState) {
        info!(job = %ctx.job_id, step = ctx.step_index, attempt = ctx.attempt, state = %state, "Job state");
    }
}

fn last_media(state: &RunState) -> Option<PathBuf> {
    state
        .steps
        .iter()
        .rev()
        .filter_map(|s| s.get("output_path").and_then(Value::as_str))
        .map(PathBuf::from)
        .find(|p| media_kind_of(p).is_some())
}

/// Media kind of a produced artifact; directories count only as frame sequences
fn media_kind_of(path: &Path) -> Option<MediaKind> {
    if path.is_dir() && !path.join("clip.json").exists() {
        return None;
    }
    MediaKind::from_path(path)
}

/// Step arguments with references resolved and run-time inputs injected
fn prepare_args(
    step_args: &Args,
    spec: &ToolSpec,
    state: &RunState,
    user_text: &str,
) -> Result<Args, ShieldError> {
    let mut args = Args::new();
    for (key, value) in step_args {
        let resolved = match value.as_str().and_then(|s| s.strip_prefix(PREV_PREFIX)) {
            Some(field) => state
                .prev
                .as_ref()
                .and_then(|p| p.field(field))
                .ok_or_else(|| {
                    ShieldError::MalformedManifest(format!(
                        "argument '{}' references missing previous output '{}'",
                        key, field
                    ))
                })?,
            None => value.clone(),
        };
        args.insert(key.clone(), resolved);
    }

    for (kind, path) in &state.media {
        args.entry(kind.arg_name())
            .or_insert_with(|| Value::String(path.to_string_lossy().into_owned()));
    }

    let wants = |name: &str| spec.input_contract.iter().any(|i| i == name);
    if wants("intent") {
        args.entry("intent")
            .or_insert_with(|| Value::String(user_text.to_string()));
    }

    // Inputs the previous step already produced, e.g. mask_stream_path
    if let Some(prev) = &state.prev {
        for input in &spec.input_contract {
            if args.contains_key(input) {
                continue;
            }
            if let Some(value) = prev.summary.get(input) {
                args.insert(input.clone(), value.clone());
            }
        }
    }
    Ok(args)
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(from, to).map(|_| ())
    }
}
