//! Built-in audio tools: `detect_keywords`, `mute_segments`, `mute_keywords`

use async_trait::async_trait;
use serde_json::{json, Value};
use shield_sdk::errors::ShieldError;
use shield_sdk::tool_spec::{ToolKind, ToolSpec};
use shield_sdk::types::{ApplyOutput, ToolArgs, VerifyOutput};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{run_blocking, Args, Detection, PrivacyTool, StageContext, ToolDeps};
use crate::audio::live::{run_live, ChunkedTranscriber, LiveRedactor};
use crate::audio::redact::{apply_segments, pad_segments, Tone};
use crate::audio::{
    extract_phrases, load_segments, localize, save_segments, transcript_text, AudioClip,
    RedactionMode, RedactionSegment, SpeechDetection,
};
use crate::config::AudioConfig;
use crate::verify;

const SEGMENTS_FILE: &str = "segments.json";
const DEFAULT_INTENT: &str = "Remove personal or sensitive information";

#[derive(Debug, Clone, Copy)]
struct Settings {
    mode: RedactionMode,
    pad_secs: f64,
    fuzzy_threshold: f64,
}

fn settings(cfg: &AudioConfig, args: &Args) -> Settings {
    Settings {
        mode: args
            .param_str_opt("mode")
            .and_then(|m| m.parse().ok())
            .unwrap_or(cfg.mode),
        pad_secs: args.param_u64_opt("pad_ms").unwrap_or(cfg.pad_ms) as f64 / 1000.0,
        fuzzy_threshold: args
            .param_f64_opt("fuzzy_threshold")
            .unwrap_or(cfg.fuzzy_threshold)
            .clamp(0.0, 1.0),
    }
}

fn is_live(args: &Args) -> bool {
    args.param_bool_opt("live").unwrap_or(false)
}

fn speech(detection: Option<&Detection>) -> Result<&SpeechDetection, ShieldError> {
    match detection {
        Some(Detection::Speech(s)) => Ok(s),
        _ => Err(ShieldError::ToolExecution(
            "transform needs verified redaction segments".to_string(),
        )),
    }
}

async fn read_clip(path: PathBuf) -> Result<AudioClip, ShieldError> {
    run_blocking(move || Ok(AudioClip::read(&path)?)).await
}

/// Transcribe, pick sensitive phrases, and localize them
async fn find_phrases(deps: &ToolDeps, ctx: &StageContext, args: &Args) -> Result<SpeechDetection, ShieldError> {
    let path = args.param_path("audio_path")?;
    let s = settings(&deps.config.audio, args);
    let clip = read_clip(path).await?;
    let duration = clip.duration();

    let transcriber = Arc::clone(&deps.transcriber);
    let words = run_blocking(move || Ok(transcriber.transcribe(&clip)?)).await?;
    ctx.check_cancelled()?;

    let phrases = match args.param_str_list("keywords") {
        Some(list) if !list.is_empty() => list,
        _ => {
            let intent = args
                .param_str_opt("intent")
                .unwrap_or_else(|| DEFAULT_INTENT.to_string());
            extract_phrases(
                deps.llm.as_ref(),
                &transcript_text(&words),
                &intent,
                Duration::from_secs(deps.config.llm.timeout_secs),
            )
            .await?
        }
    };

    let found = localize(&words, &phrases, s.fuzzy_threshold, s.mode);
    let segments = pad_segments(&found, s.pad_secs, duration);
    debug!(
        words = words.len(),
        phrases = phrases.len(),
        segments = segments.len(),
        "Localized sensitive phrases"
    );
    Ok(SpeechDetection {
        words,
        phrases,
        segments,
        duration,
    })
}

fn redacted_path(ctx: &StageContext, audio: &Path) -> PathBuf {
    let stem = audio.file_stem().and_then(|s| s.to_str()).unwrap_or("audio");
    ctx.output_dir.join(format!("{}_redacted.wav", stem))
}

/// Overwrite every segment and export in the source format
async fn redact(
    deps: &ToolDeps,
    ctx: &StageContext,
    args: &Args,
    segments: &[RedactionSegment],
) -> Result<ApplyOutput, ShieldError> {
    let audio = args.param_path("audio_path")?;
    let out = redacted_path(ctx, &audio);
    let tone = Tone::offline(deps.config.audio.beep_hz);
    let segments = segments.to_vec();
    let target = out.clone();
    let count = segments.len();

    run_blocking(move || {
        let mut clip = AudioClip::read(&audio)?;
        apply_segments(&mut clip, &segments, tone);
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)?;
        }
        clip.write(&target)?;
        Ok(())
    })
    .await?;

    Ok(ApplyOutput::new(out).with_summary("segments", json!(count)))
}

fn integrity(deps: &ToolDeps, detection: &Detection) -> VerifyOutput {
    match detection {
        Detection::Speech(s) => {
            verify::temporal_integrity(&s.segments, s.duration, &deps.config.verification)
        }
        _ => VerifyOutput::fail("expected redaction segments"),
    }
}

/// Widen padding and loosen matching after a compliance failure
fn adjust(deps: &ToolDeps, args: &Args, failure: &ShieldError) -> Args {
    let mut next = args.clone();
    let s = settings(&deps.config.audio, args);
    match failure {
        ShieldError::RedactionVerificationFailure(_) => {
            let pad_ms = ((s.pad_secs * 1000.0).round() as u64).max(75) * 2;
            next.insert("pad_ms".to_string(), json!(pad_ms));
            let fuzzy = ((s.fuzzy_threshold - 0.1) * 100.0).round() / 100.0;
            next.insert("fuzzy_threshold".to_string(), json!(fuzzy.max(0.5)));
        }
        ShieldError::TemporalIntegrityError(_) => {
            next.insert("pad_ms".to_string(), json!(0));
        }
        _ => {}
    }
    next
}

pub struct DetectKeywords {
    deps: ToolDeps,
}

impl DetectKeywords {
    pub fn new(deps: ToolDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl PrivacyTool for DetectKeywords {
    fn spec(&self) -> ToolSpec {
        ToolSpec::builtin(
            "detect_keywords",
            ToolKind::Detector,
            "Transcribe audio and locate sensitive phrases; writes redaction segments",
        )
        .with_inputs(&["audio_path", "keywords", "intent", "mode", "pad_ms", "fuzzy_threshold"])
        .with_outputs(&["output_path", "segments_path", "segments"])
    }

    async fn detect(&self, ctx: &StageContext, args: &Args) -> Result<Option<Detection>, ShieldError> {
        Ok(Some(Detection::Speech(find_phrases(&self.deps, ctx, args).await?)))
    }

    fn verify_detection(&self, detection: &Detection) -> VerifyOutput {
        integrity(&self.deps, detection)
    }

    async fn apply(
        &self,
        ctx: &StageContext,
        _args: &Args,
        detection: Option<&Detection>,
    ) -> Result<ApplyOutput, ShieldError> {
        let s = speech(detection)?;
        std::fs::create_dir_all(&ctx.output_dir)?;
        let path = ctx.output_dir.join(SEGMENTS_FILE);
        save_segments(&path, &s.segments)?;
        Ok(ApplyOutput::new(&path)
            .with_summary("segments_path", json!(path.to_string_lossy()))
            .with_summary("segments", json!(s.segments.len()))
            .with_summary("phrases", json!(s.phrases)))
    }

    async fn verify(
        &self,
        _ctx: &StageContext,
        _args: &Args,
        output: &ApplyOutput,
        detection: Option<&Detection>,
    ) -> Result<VerifyOutput, ShieldError> {
        let s = speech(detection)?;
        let written = load_segments(&output.output_path)?;
        Ok(verify::temporal_integrity(
            &written,
            s.duration,
            &self.deps.config.verification,
        ))
    }

    fn substitute(&self, args: &Args, _attempt: u32, failure: &ShieldError) -> Args {
        adjust(&self.deps, args, failure)
    }
}

pub struct MuteSegments {
    deps: ToolDeps,
}

impl MuteSegments {
    pub fn new(deps: ToolDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl PrivacyTool for MuteSegments {
    fn spec(&self) -> ToolSpec {
        ToolSpec::builtin(
            "mute_segments",
            ToolKind::Transform,
            "Silence or beep the time segments listed in a segments file",
        )
        .with_inputs(&["audio_path", "segments_path", "mode"])
        .with_outputs(&["output_path"])
    }

    /// Loads and checks the segments a previous step produced
    async fn detect(&self, _ctx: &StageContext, args: &Args) -> Result<Option<Detection>, ShieldError> {
        let path = args.param_path("segments_path")?;
        let mut segments = load_segments(&path)?;
        if let Some(mode) = args.param_str_opt("mode").and_then(|m| m.parse().ok()) {
            segments.iter_mut().for_each(|s| s.mode = mode);
        }
        let clip = read_clip(args.param_path("audio_path")?).await?;
        Ok(Some(Detection::Speech(SpeechDetection {
            segments,
            duration: clip.duration(),
            ..Default::default()
        })))
    }

    fn verify_detection(&self, detection: &Detection) -> VerifyOutput {
        integrity(&self.deps, detection)
    }

    async fn apply(
        &self,
        ctx: &StageContext,
        args: &Args,
        detection: Option<&Detection>,
    ) -> Result<ApplyOutput, ShieldError> {
        redact(&self.deps, ctx, args, &speech(detection)?.segments).await
    }

    async fn verify(
        &self,
        _ctx: &StageContext,
        _args: &Args,
        output: &ApplyOutput,
        detection: Option<&Detection>,
    ) -> Result<VerifyOutput, ShieldError> {
        let s = speech(detection)?;
        let written = read_clip(output.output_path.clone()).await?;
        if (written.duration() - s.duration).abs() > 1e-3 {
            return Ok(VerifyOutput::fail(format!(
                "redacted clip lasts {:.3}s, source {:.3}s",
                written.duration(),
                s.duration
            )));
        }
        Ok(verify::temporal_integrity(
            &s.segments,
            s.duration,
            &self.deps.config.verification,
        ))
    }

    fn substitute(&self, args: &Args, _attempt: u32, failure: &ShieldError) -> Args {
        adjust(&self.deps, args, failure)
    }
}

/// Transcribe, extract, localize, verify, redact, then re-check compliance
pub struct MuteKeywords {
    deps: ToolDeps,
}

impl MuteKeywords {
    pub fn new(deps: ToolDeps) -> Self {
        Self { deps }
    }

    async fn live(&self, ctx: &StageContext, args: &Args) -> Result<ApplyOutput, ShieldError> {
        let phrases = args
            .param_str_list("keywords")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ShieldError::ToolExecution("live muting needs 'keywords'".to_string()))?;
        let audio = args.param_path("audio_path")?;
        let clip = read_clip(audio.clone()).await?;
        let cfg = &self.deps.config.audio;
        let mut live_cfg = cfg.clone();
        let s = settings(cfg, args);
        live_cfg.mode = s.mode;
        live_cfg.fuzzy_threshold = s.fuzzy_threshold;

        let stream = ChunkedTranscriber::new(
            Arc::clone(&self.deps.transcriber),
            clip.spec.channels,
            clip.sample_rate(),
        );
        let redactor = LiveRedactor::new(stream, phrases, &live_cfg, clip.channels(), clip.sample_rate());
        let depth = redactor.delay_chunks();
        let (out, stats) = run_live(clip, redactor, cfg.chunk_ms, depth, ctx.cancel.clone()).await?;

        let path = redacted_path(ctx, &audio);
        let target = path.clone();
        run_blocking(move || {
            if let Some(dir) = target.parent() {
                std::fs::create_dir_all(dir)?;
            }
            Ok(out.write(&target)?)
        })
        .await?;

        Ok(ApplyOutput::new(path)
            .with_summary("live", Value::Bool(true))
            .with_summary("redacted_chunks", json!(stats.redacted_chunks))
            .with_summary("failed_closed_chunks", json!(stats.failed_closed))
            .with_summary("transcriber_errors", json!(stats.transcriber_errors)))
    }
}

#[async_trait]
impl PrivacyTool for MuteKeywords {
    fn spec(&self) -> ToolSpec {
        ToolSpec::builtin(
            "mute_keywords",
            ToolKind::Composite,
            "Find sensitive phrases in speech and mute or beep them (offline, or live with live=true)",
        )
        .with_inputs(&[
            "audio_path",
            "keywords",
            "intent",
            "mode",
            "pad_ms",
            "fuzzy_threshold",
            "live",
        ])
        .with_outputs(&["output_path", "segments"])
    }

    async fn detect(&self, ctx: &StageContext, args: &Args) -> Result<Option<Detection>, ShieldError> {
        if is_live(args) {
            return Ok(None);
        }
        Ok(Some(Detection::Speech(find_phrases(&self.deps, ctx, args).await?)))
    }

    fn verify_detection(&self, detection: &Detection) -> VerifyOutput {
        integrity(&self.deps, detection)
    }

    async fn apply(
        &self,
        ctx: &StageContext,
        args: &Args,
        detection: Option<&Detection>,
    ) -> Result<ApplyOutput, ShieldError> {
        if is_live(args) {
            info!(step = ctx.step_index, "Live keyword muting; output is not verified before release");
            return self.live(ctx, args).await;
        }
        let s = speech(detection)?;
        Ok(redact(&self.deps, ctx, args, &s.segments)
            .await?
            .with_summary("phrases", json!(s.phrases)))
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
        let s = speech(detection)?.clone();
        let fuzzy = settings(&self.deps.config.audio, args).fuzzy_threshold;
        let temporal =
            verify::temporal_integrity(&s.segments, s.duration, &self.deps.config.verification);

        let transcriber = Arc::clone(&self.deps.transcriber);
        let path = output.output_path.clone();
        let compliance = run_blocking(move || {
            let redacted = AudioClip::read(&path)?;
            Ok(verify::compliance(&redacted, transcriber.as_ref(), &s.phrases, fuzzy)?)
        })
        .await?;
        Ok(verify::combine(temporal, compliance))
    }

    fn substitute(&self, args: &Args, _attempt: u32, failure: &ShieldError) -> Args {
        adjust(&self.deps, args, failure)
    }
}
