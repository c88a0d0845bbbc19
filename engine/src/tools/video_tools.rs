//! Built-in video tools: `detect_faces`, `blur`, `blur_faces`

use async_trait::async_trait;
use serde_json::{json, Value};
use shield_sdk::errors::ShieldError;
use shield_sdk::tool_spec::{ToolKind, ToolSpec};
use shield_sdk::types::{ApplyOutput, ToolArgs, VerifyOutput};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{run_blocking, Args, Detection, PrivacyTool, StageContext, ToolDeps};
use crate::config::VideoConfig;
use crate::verify;
use crate::video::blur::{blur_clip, next_kernel, BlurParams};
use crate::video::engine::EngineParams;
use crate::video::live::run_live;
use crate::video::{FrameSequence, FrameWriter, TrackLog, TrackingEngine};

const TRACK_LOG_FILE: &str = "tracks.json";

fn engine_params(cfg: &VideoConfig, args: &Args) -> EngineParams {
    let mut params = EngineParams::from(cfg);
    if let Some(every) = args.param_u64_opt("detect_every") {
        params.detect_every = every.max(1) as u32;
    }
    params
}

fn blur_params(cfg: &VideoConfig, args: &Args) -> BlurParams {
    let mut kernel = args.param_u64_opt("kernel").map_or(cfg.kernel, |k| k as u32);
    if kernel % 2 == 0 {
        kernel += 1;
    }
    let scale = args
        .param_f64_opt("blur_scale")
        .map_or(cfg.blur_scale, |s| s as f32)
        .max(1.0);
    BlurParams::new(scale, kernel.max(3))
}

fn is_live(args: &Args) -> bool {
    args.param_bool_opt("live").unwrap_or(false)
}

fn faces(detection: Option<&Detection>) -> Result<&TrackLog, ShieldError> {
    match detection {
        Some(Detection::Faces(log)) => Ok(log),
        _ => Err(ShieldError::ToolExecution(
            "transform needs a verified face track log".to_string(),
        )),
    }
}

/// Run the tracking pass over the input clip
async fn track_faces(deps: &ToolDeps, ctx: &StageContext, args: &Args) -> Result<TrackLog, ShieldError> {
    let video = args.param_path("video_path")?;
    let params = engine_params(&deps.config.video, args);
    let detector = Arc::clone(&deps.detector);
    let cancel = ctx.cancel.clone();
    debug!(video = %video.display(), detect_every = params.detect_every, "Tracking faces");
    run_blocking(move || {
        let clip = FrameSequence::open(&video)?;
        let mut engine = TrackingEngine::new(params, detector);
        Ok(engine.run(&clip, &cancel)?)
    })
    .await
}

fn blurred_dir(ctx: &StageContext, video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    ctx.output_dir.join(format!("{}_blurred", stem))
}

/// Second pass over the clip with trusted coordinates
async fn blur_pass(
    deps: &ToolDeps,
    ctx: &StageContext,
    args: &Args,
    log: &TrackLog,
) -> Result<ApplyOutput, ShieldError> {
    let video = args.param_path("video_path")?;
    let params = blur_params(&deps.config.video, args);
    let out_dir = blurred_dir(ctx, &video);
    let log = log.clone();
    let cancel = ctx.cancel.clone();
    let target = out_dir.clone();

    let report = run_blocking(move || {
        let clip = FrameSequence::open(&video)?;
        Ok(blur_clip(&clip, &log, &target, params, &cancel)?)
    })
    .await?;

    Ok(ApplyOutput::new(out_dir)
        .with_summary("frames", json!(report.frames))
        .with_summary("blurred_regions", json!(report.regions))
        .with_summary("kernel", json!(params.kernel))
        .with_summary("blur_scale", json!(params.scale)))
}

async fn check_intensity(
    deps: &ToolDeps,
    args: &Args,
    output: &ApplyOutput,
    log: &TrackLog,
) -> Result<VerifyOutput, ShieldError> {
    let params = blur_params(&deps.config.video, args);
    let cfg = deps.config.verification.clone();
    let out_dir = output.output_path.clone();
    let log = log.clone();
    run_blocking(move || {
        let seq = FrameSequence::open(&out_dir)?;
        Ok(verify::intensity(&seq, &log, params.scale, &cfg)?)
    })
    .await
}

/// Live detect-then-blur with no pre-release verification
async fn live_pass(deps: &ToolDeps, ctx: &StageContext, args: &Args) -> Result<ApplyOutput, ShieldError> {
    let video = args.param_path("video_path")?;
    let clip = FrameSequence::open(&video).map_err(ShieldError::from)?;
    let out_dir = blurred_dir(ctx, &video);
    let mut writer = FrameWriter::create(&out_dir, clip.fps).map_err(ShieldError::from)?;
    let engine = TrackingEngine::new(
        engine_params(&deps.config.video, args),
        Arc::clone(&deps.detector),
    );
    let stats = run_live(
        clip,
        engine,
        blur_params(&deps.config.video, args),
        deps.config.video.live_buffer_frames,
        &mut writer,
        ctx.cancel.clone(),
    )
    .await?;
    Ok(ApplyOutput::new(out_dir)
        .with_summary("frames", json!(stats.frames))
        .with_summary("blurred_regions", json!(stats.regions))
        .with_summary("live", Value::Bool(true)))
}

/// Lower the detector cadence after a detection failure, raise the kernel
/// after a weak blur
fn adjust(deps: &ToolDeps, args: &Args, failure: &ShieldError) -> Args {
    let mut next = args.clone();
    match failure {
        ShieldError::DetectionVerificationFailure(_) => {
            let every = args
                .param_u64_opt("detect_every")
                .unwrap_or(deps.config.video.detect_every as u64);
            next.insert("detect_every".to_string(), json!(every.saturating_sub(1).max(1)));
        }
        ShieldError::RedactionVerificationFailure(_) => {
            let kernel = blur_params(&deps.config.video, args).kernel;
            next.insert("kernel".to_string(), json!(next_kernel(kernel)));
        }
        _ => {}
    }
    next
}

pub struct DetectFaces {
    deps: ToolDeps,
}

impl DetectFaces {
    pub fn new(deps: ToolDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl PrivacyTool for DetectFaces {
    fn spec(&self) -> ToolSpec {
        ToolSpec::builtin(
            "detect_faces",
            ToolKind::Detector,
            "Detect and track faces across a video; writes a per-frame track log",
        )
        .with_inputs(&["video_path", "detect_every"])
        .with_outputs(&["output_path", "mask_stream_path", "tracks"])
    }

    async fn detect(&self, ctx: &StageContext, args: &Args) -> Result<Option<Detection>, ShieldError> {
        Ok(Some(Detection::Faces(track_faces(&self.deps, ctx, args).await?)))
    }

    fn verify_detection(&self, detection: &Detection) -> VerifyOutput {
        match detection {
            Detection::Faces(log) => verify::continuity(log, &self.deps.config.verification),
            _ => VerifyOutput::fail("expected face tracks"),
        }
    }

    async fn apply(
        &self,
        ctx: &StageContext,
        _args: &Args,
        detection: Option<&Detection>,
    ) -> Result<ApplyOutput, ShieldError> {
        let log = faces(detection)?;
        std::fs::create_dir_all(&ctx.output_dir)?;
        let path = ctx.output_dir.join(TRACK_LOG_FILE);
        log.save(&path)?;
        Ok(ApplyOutput::new(&path)
            .with_summary("mask_stream_path", json!(path.to_string_lossy()))
            .with_summary("tracks", json!(log.track_count()))
            .with_summary("frames", json!(log.frames.len())))
    }

    async fn verify(
        &self,
        _ctx: &StageContext,
        _args: &Args,
        output: &ApplyOutput,
        _detection: Option<&Detection>,
    ) -> Result<VerifyOutput, ShieldError> {
        match TrackLog::load(&output.output_path) {
            Ok(log) => Ok(VerifyOutput::pass().with_detail("tracks", json!(log.track_count()))),
            Err(e) => Ok(VerifyOutput::fail(format!("track log unreadable: {}", e))),
        }
    }

    fn substitute(&self, args: &Args, _attempt: u32, failure: &ShieldError) -> Args {
        adjust(&self.deps, args, failure)
    }
}

pub struct Blur {
    deps: ToolDeps,
}

impl Blur {
    pub fn new(deps: ToolDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl PrivacyTool for Blur {
    fn spec(&self) -> ToolSpec {
        ToolSpec::builtin(
            "blur",
            ToolKind::Transform,
            "Blur the regions of a face track log in a video",
        )
        .with_inputs(&["video_path", "mask_stream_path", "kernel", "blur_scale"])
        .with_outputs(&["output_path"])
    }

    /// Loads the track log a previous step produced
    async fn detect(&self, _ctx: &StageContext, args: &Args) -> Result<Option<Detection>, ShieldError> {
        let path = args
            .param_path("mask_stream_path")
            .or_else(|_| args.param_path("tracks_path"))?;
        Ok(Some(Detection::Faces(TrackLog::load(&path)?)))
    }

    fn verify_detection(&self, detection: &Detection) -> VerifyOutput {
        match detection {
            Detection::Faces(log) => verify::continuity(log, &self.deps.config.verification),
            _ => VerifyOutput::fail("expected face tracks"),
        }
    }

    async fn apply(
        &self,
        ctx: &StageContext,
        args: &Args,
        detection: Option<&Detection>,
    ) -> Result<ApplyOutput, ShieldError> {
        blur_pass(&self.deps, ctx, args, faces(detection)?).await
    }

    async fn verify(
        &self,
        _ctx: &StageContext,
        args: &Args,
        output: &ApplyOutput,
        detection: Option<&Detection>,
    ) -> Result<VerifyOutput, ShieldError> {
        check_intensity(&self.deps, args, output, faces(detection)?).await
    }

    fn substitute(&self, args: &Args, _attempt: u32, failure: &ShieldError) -> Args {
        adjust(&self.deps, args, failure)
    }
}

/// Detect, verify, then blur in one step
pub struct BlurFaces {
    deps: ToolDeps,
}

impl BlurFaces {
    pub fn new(deps: ToolDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl PrivacyTool for BlurFaces {
    fn spec(&self) -> ToolSpec {
        ToolSpec::builtin(
            "blur_faces",
            ToolKind::Composite,
            "Detect, track and blur every face in a video (offline two-pass, or live with live=true)",
        )
        .with_inputs(&["video_path", "detect_every", "kernel", "blur_scale", "live"])
        .with_outputs(&["output_path", "mask_stream_path"])
    }

    async fn detect(&self, ctx: &StageContext, args: &Args) -> Result<Option<Detection>, ShieldError> {
        if is_live(args) {
            return Ok(None);
        }
        Ok(Some(Detection::Faces(track_faces(&self.deps, ctx, args).await?)))
    }

    fn verify_detection(&self, detection: &Detection) -> VerifyOutput {
        match detection {
            Detection::Faces(log) => verify::continuity(log, &self.deps.config.verification),
            _ => VerifyOutput::fail("expected face tracks"),
        }
    }

    async fn apply(
        &self,
        ctx: &StageContext,
        args: &Args,
        detection: Option<&Detection>,
    ) -> Result<ApplyOutput, ShieldError> {
        if is_live(args) {
            info!(step = ctx.step_index, "Live face blurring; output is not verified before release");
            return live_pass(&self.deps, ctx, args).await;
        }
        let log = faces(detection)?;
        std::fs::create_dir_all(&ctx.output_dir)?;
        let log_path = ctx.output_dir.join(TRACK_LOG_FILE);
        log.save(&log_path)?;
        Ok(blur_pass(&self.deps, ctx, args, log)
            .await?
            .with_summary("mask_stream_path", json!(log_path.to_string_lossy()))
            .with_summary("tracks", json!(log.track_count())))
    }

    async fn verify(
        &self,
        _ctx: &StageContext,
        args: &Args,
        output: &ApplyOutput,
        detection: Option<&Detection>,
    ) -> Result<VerifyOutput, ShieldError> {
        if is_live(args) {
            return Ok(VerifyOutput::pass().with_detail("live", Value::Bool(true)));
        }
        check_intensity(&self.deps, args, output, faces(detection)?).await
    }

    fn substitute(&self, args: &Args, _attempt: u32, failure: &ShieldError) -> Args {
        adjust(&self.deps, args, failure)
    }
}
