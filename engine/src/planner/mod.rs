//! Pipeline Planner
//!
//! Turns a natural-language request into a [`Manifest`]. The model sees the
//! registry catalogue and must answer with `{"pipeline": [{"tool", "args"}]}`.
//! Proposed tools the registry lacks are handed to the [`ToolGenerator`];
//! planning blocks until each is registered or its generation attempts run
//! out.
//!
//! On replan the prompt also carries a [`DiagnosticContext`] describing what
//! failed last time, so the model can pick a substitute tool or adjust
//! arguments.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shield_sdk::audit::{AuditEntry, AuditStage};
use shield_sdk::errors::ShieldError;
use shield_sdk::manifest::{Manifest, Step};
use shield_sdk::tool_spec::{ToolOrigin, ToolSpec};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audit::AuditSink;
use crate::generator::{follows_convention, ToolGenerator};
use crate::llm::{extract_json, LLMProvider, Message};
use crate::registry::ToolRegistry;
use crate::tools::Args;

/// Model calls per plan before a timeout or network error is reported
const PLAN_CALL_ATTEMPTS: u32 = 3;

const SYSTEM_PROMPT: &str = "You are a privacy-protection pipeline planner. Given a user request, \
produce a JSON manifest of the form {\"pipeline\": [{\"tool\": <name>, \"args\": {...}}]}.

Available tools:
{catalogue}

Naming convention for tools that are not listed:
- detection: detect_<object> (detect_license_plates, detect_text)
- blurring or removal: blur_<object> or remove_<object> (blur_license_plates)
- audio processing: <action>_<target> (transcribe_audio, enhance_audio)

Rules:
- Prefer listed tools, and prefer composite tools (blur_faces, mute_keywords) over manual chaining.
- Propose a sensible new tool name instead of refusing; missing tools are generated.
- Blur kernels must be odd numbers.
- For audio requests pass the user's request as the \"intent\" argument.
- Do not set video_path or audio_path; the input file is supplied at run time.
- Reply with the JSON object only.";

/// What went wrong in the previous manifest, fed back on replan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticContext {
    pub prior_manifest: Manifest,
    /// Index of the failing step
    pub step: usize,
    pub tool: String,
    /// detect, verify_detection, apply or verify
    pub stage: String,
    pub category: String,
    pub reason: String,
    /// Verification details of the last failed attempt
    #[serde(default)]
    pub metrics: Map<String, Value>,
    /// Arguments of every attempt, first to last
    #[serde(default)]
    pub args_tried: Vec<Args>,
}

impl DiagnosticContext {
    pub fn is_empty(&self) -> bool {
        self.tool.is_empty() && self.reason.is_empty() && self.metrics.is_empty()
    }

    fn to_prompt(&self) -> String {
        let manifest = self
            .prior_manifest
            .to_json()
            .unwrap_or_else(|_| "{}".to_string());
        let tried: Vec<String> = self
            .args_tried
            .iter()
            .map(|a| Value::Object(a.clone()).to_string())
            .collect();
        format!(
            "The previous pipeline failed.\n\
             Previous manifest: {}\n\
             Failing step: {} ({}) in stage {}\n\
             Failure: {}: {}\n\
             Verification metrics: {}\n\
             Arguments tried: [{}]\n\
             Propose a pipeline that avoids this failure, using a different tool or adjusted arguments.",
            manifest,
            self.step,
            self.tool,
            self.stage,
            self.category,
            self.reason,
            Value::Object(self.metrics.clone()),
            tried.join(", ")
        )
    }
}

pub struct Planner {
    llm: Arc<dyn LLMProvider>,
    registry: Arc<ToolRegistry>,
    generator: Arc<ToolGenerator>,
    audit: Arc<dyn AuditSink>,
    llm_timeout: Duration,
    max_attempts: u32,
}

impl Planner {
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        registry: Arc<ToolRegistry>,
        generator: Arc<ToolGenerator>,
        audit: Arc<dyn AuditSink>,
        llm_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            llm,
            registry,
            generator,
            audit,
            llm_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Produce a manifest whose every tool is registered
    pub async fn plan(
        &self,
        user_text: &str,
        diagnostics: Option<&DiagnosticContext>,
    ) -> Result<Manifest, ShieldError> {
        let result = self.plan_inner(user_text, diagnostics).await;
        match &result {
            Ok(manifest) => {
                let names: Vec<&str> = manifest.tool_names().collect();
                self.audit.append(AuditEntry::ok(
                    AuditStage::Plan,
                    format!("{} step(s): {}", names.len(), names.join(", ")),
                ));
            }
            Err(e) => self
                .audit
                .append(AuditEntry::fail(AuditStage::Plan, e.to_string())),
        }
        result
    }

    async fn plan_inner(
        &self,
        user_text: &str,
        diagnostics: Option<&DiagnosticContext>,
    ) -> Result<Manifest, ShieldError> {
        let replanning = diagnostics.is_some_and(|d| !d.is_empty());
        info!(replanning, "Planning request");

        let messages = self.prompt(user_text, diagnostics);
        let reply = self.ask_model(&messages).await?;

        let mut manifest = parse_manifest(&reply)?;
        manifest
            .validate()
            .map_err(|e| ShieldError::PlanningFailure(e.to_string()))?;

        // requested name -> registered name, for repeated or reconciled tools
        let mut resolved: HashMap<String, ToolSpec> = HashMap::new();
        for step in manifest.pipeline.iter_mut() {
            let spec = match resolved.get(&step.tool) {
                Some(spec) => spec.clone(),
                None => {
                    let spec = self.resolve(&step.tool, &step.args, user_text).await?;
                    resolved.insert(step.tool.clone(), spec.clone());
                    spec
                }
            };
            if spec.name != step.tool {
                info!(requested = %step.tool, actual = %spec.name, "Rewriting step to generated tool name");
                step.tool = spec.name.clone();
            }
            step.generated = spec.origin == ToolOrigin::Generated;
        }

        debug!(manifest = ?manifest, "Planned manifest");
        Ok(manifest)
    }

    /// The planning call, re-issued while it times out or the network fails
    ///
    /// A transient failure that outlives every attempt is returned as is, so
    /// it stays retryable; a rejected request is a `PlanningFailure`.
    async fn ask_model(&self, messages: &[Message]) -> Result<String, ShieldError> {
        let mut attempt = 1;
        loop {
            let error = match tokio::time::timeout(self.llm_timeout, self.llm.complete(messages, true)).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) if e.is_transient() => ShieldError::from(e),
                Ok(Err(e)) => {
                    return Err(ShieldError::PlanningFailure(format!("model call failed: {}", e)))
                }
                Err(_) => ShieldError::ExecutionTimeout {
                    stage: "plan".to_string(),
                    secs: self.llm_timeout.as_secs(),
                },
            };
            if attempt >= PLAN_CALL_ATTEMPTS {
                return Err(error);
            }
            warn!(provider = self.llm.name(), attempt, error = %error, "Planning call failed, retrying");
            attempt += 1;
        }
    }

    /// Registered spec for `name`, generating it when absent
    async fn resolve(&self, name: &str, args: &Args, user_text: &str) -> Result<ToolSpec, ShieldError> {
        if let Some(spec) = self.registry.lookup(name) {
            return Ok(spec);
        }
        if !follows_convention(name) {
            return Err(ShieldError::PlanningFailure(format!(
                "proposed tool '{}' does not follow the naming convention",
                name
            )));
        }

        let description = describe(name, user_text);
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            info!(tool = name, attempt, "Generating missing tool");
            match self.generator.generate(name, &description, args).await {
                Ok(spec) => {
                    self.audit.append(AuditEntry::ok(
                        AuditStage::Generate,
                        format!("{} generated as {}", name, spec.name),
                    ));
                    return Ok(spec);
                }
                Err(e) => {
                    warn!(tool = name, attempt, error = %e, "Tool generation failed");
                    self.audit.append(AuditEntry::fail(
                        AuditStage::Generate,
                        format!("{} attempt {}: {}", name, attempt, e),
                    ));
                    last_error = e.to_string();
                }
            }
        }
        Err(ShieldError::PlanningFailure(format!(
            "tool '{}' could not be generated after {} attempt(s): {}",
            name, self.max_attempts, last_error
        )))
    }

    fn prompt(&self, user_text: &str, diagnostics: Option<&DiagnosticContext>) -> Vec<Message> {
        let catalogue: Vec<String> = self
            .registry
            .specs()
            .iter()
            .map(|s| {
                format!(
                    "- {} ({}): {} Args: {}",
                    s.name,
                    s.kind.as_str(),
                    s.description,
                    s.input_contract.join(", ")
                )
            })
            .collect();
        let system = SYSTEM_PROMPT.replace("{catalogue}", &catalogue.join("\n"));

        let mut user = format!("Request: {}", user_text);
        if let Some(d) = diagnostics.filter(|d| !d.is_empty()) {
            user.push_str("\n\n");
            user.push_str(&d.to_prompt());
        }
        vec![Message::system(system), Message::user(user)]
    }
}

/// Parse model output into a manifest, normalizing tool names and arguments
pub fn parse_manifest(reply: &str) -> Result<Manifest, ShieldError> {
    let value = extract_json(reply)
        .ok_or_else(|| ShieldError::PlanningFailure("model output is not JSON".to_string()))?;
    let value = match value {
        Value::Array(steps) => serde_json::json!({ "pipeline": steps }),
        other => other,
    };
    let mut manifest: Manifest = serde_json::from_value(value)
        .map_err(|e| ShieldError::PlanningFailure(format!("manifest schema: {}", e)))?;

    for step in manifest.pipeline.iter_mut() {
        normalize_step(step);
    }
    Ok(manifest)
}

fn normalize_step(step: &mut Step) {
    step.tool = step
        .tool
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect();
    // Tools generated by the model itself are decided here, not by the model
    step.generated = false;
    if let Some(intent) = step.args.remove("user_intent") {
        step.args.entry("intent").or_insert(intent);
    }
}

fn describe(name: &str, user_text: &str) -> String {
    let words = |s: &str| s.replace('_', " ");
    let capability = if let Some(object) = name.strip_prefix("detect_") {
        format!("Detect {} in the input and report their locations", words(object))
    } else if let Some(object) = name.strip_prefix("blur_") {
        format!("Blur {} in the input video", words(object))
    } else if let Some(object) = name.strip_prefix("remove_") {
        format!("Remove {} from the input", words(object))
    } else {
        format!("Perform '{}' on the input", words(name))
    };
    format!(
        "{}. Requested as part of: \"{}\". Only implement this tool; other parts of the request may be covered by existing tools.",
        capability, user_text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::GeneratorConfig;
    use crate::llm::ScriptedProvider;
    use crate::tools::ScriptedTool;
    use shield_sdk::audit::AuditOutcome;
    use shield_sdk::errors::{FailureClass, ShieldErrorExt};
    use shield_sdk::tool_spec::ToolKind;

    const PLATES: &str = "from tool_api import PrivacyTool\n\
        class BlurPlates(PrivacyTool):\n    name = \"blur_license_plates\"\n\
        \x20   def apply(self, output_dir, **kw):\n        return {\"output_path\": output_dir + \"/o.mp4\"}\n\
        \x20   def verify(self, **kw):\n        return {\"verified\": True}\n\
        TOOL = BlurPlates()\n";

    struct Fixture {
        planner: Planner,
        llm: Arc<ScriptedProvider>,
        registry: Arc<ToolRegistry>,
        audit: Arc<MemoryAuditSink>,
        _dir: tempfile::TempDir,
    }

    fn fixture(llm: ScriptedProvider) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(llm);
        let registry = Arc::new(ToolRegistry::new());
        for (name, kind) in [
            ("detect_faces", ToolKind::Detector),
            ("blur", ToolKind::Transform),
            ("blur_faces", ToolKind::Composite),
            ("mute_keywords", ToolKind::Composite),
        ] {
            registry
                .register(Arc::new(ScriptedTool::new(ToolSpec::builtin(name, kind, "test"))))
                .unwrap();
        }
        let generator = Arc::new(
            ToolGenerator::new(
                Arc::clone(&llm) as Arc<dyn LLMProvider>,
                Arc::clone(&registry),
                GeneratorConfig {
                    tools_dir: dir.path().join("tools"),
                    ..GeneratorConfig::default()
                },
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let audit = Arc::new(MemoryAuditSink::new());
        let planner = Planner::new(
            Arc::clone(&llm) as Arc<dyn LLMProvider>,
            Arc::clone(&registry),
            generator,
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            Duration::from_secs(5),
            2,
        );
        Fixture {
            planner,
            llm,
            registry,
            audit,
            _dir: dir,
        }
    }

    /// Sleeps past the deadline on its first `slow_calls` calls, then plans
    struct SlowModel {
        slow_calls: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl SlowModel {
        fn new(slow_calls: usize) -> Self {
            Self {
                slow_calls,
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl LLMProvider for SlowModel {
        fn name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _messages: &[Message], _json_mode: bool) -> crate::llm::Result<String> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < self.slow_calls {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(r#"{"pipeline": [{"tool": "blur_faces"}]}"#.to_string())
        }
    }

    fn slow_planner(model: Arc<SlowModel>, f: &Fixture) -> Planner {
        let generator = Arc::new(
            ToolGenerator::new(
                Arc::clone(&f.llm) as Arc<dyn LLMProvider>,
                Arc::clone(&f.registry),
                GeneratorConfig {
                    tools_dir: f._dir.path().join("tools"),
                    ..GeneratorConfig::default()
                },
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        Planner::new(
            model,
            Arc::clone(&f.registry),
            generator,
            Arc::clone(&f.audit) as Arc<dyn AuditSink>,
            Duration::from_millis(50),
            2,
        )
    }

    fn is_planner_call(messages: &[Message]) -> bool {
        messages[0].content.contains("pipeline planner")
    }

    #[tokio::test]
    async fn test_existing_tool_single_step_no_generation() {
        let f = fixture(ScriptedProvider::new([
            r#"{"pipeline": [{"tool": "blur_faces", "args": {}}]}"#,
        ]));
        let manifest = f.planner.plan("blur faces in my video", None).await.unwrap();
        assert_eq!(manifest, Manifest::new(vec![Step::new("blur_faces")]));
        assert_eq!(f.llm.call_count(), 1);
        assert!(f.llm.calls()[0][0].content.contains("- blur_faces (composite)"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_planning_failure() {
        let f = fixture(ScriptedProvider::new(["I would blur the faces"]));
        let err = f.planner.plan("blur faces", None).await.unwrap_err();
        assert!(matches!(err, ShieldError::PlanningFailure(_)));
        let entries = f.audit.entries();
        assert_eq!(entries.last().unwrap().outcome, AuditOutcome::Fail);
    }

    #[tokio::test]
    async fn test_model_timeout_is_retried() {
        let f = fixture(ScriptedProvider::new(Vec::<String>::new()));
        let model = Arc::new(SlowModel::new(1));
        let planner = slow_planner(Arc::clone(&model), &f);

        let manifest = planner.plan("blur faces in my video", None).await.unwrap();
        assert_eq!(manifest, Manifest::new(vec![Step::new("blur_faces")]));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_persistent_timeout_stays_retryable() {
        let f = fixture(ScriptedProvider::new(Vec::<String>::new()));
        let model = Arc::new(SlowModel::new(usize::MAX));
        let planner = slow_planner(Arc::clone(&model), &f);

        let err = planner.plan("blur faces", None).await.unwrap_err();
        assert!(matches!(err, ShieldError::ExecutionTimeout { ref stage, .. } if stage == "plan"));
        assert_eq!(err.class(), FailureClass::Retryable);
        assert_eq!(model.calls(), PLAN_CALL_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_names_and_intent_normalized() {
        let f = fixture(ScriptedProvider::new([
            r#"```json
{"pipeline": [{"tool": " Mute-Keywords ", "args": {"user_intent": "mute my address", "mode": "beep"}}]}
```"#,
        ]));
        let manifest = f.planner.plan("mute my address", None).await.unwrap();
        let step = &manifest.pipeline[0];
        assert_eq!(step.tool, "mute_keywords");
        assert_eq!(step.args["intent"], Value::String("mute my address".into()));
        assert!(!step.args.contains_key("user_intent"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_generated_and_renamed() {
        let f = fixture(ScriptedProvider::from_fn(|m| {
            Some(if is_planner_call(m) {
                r#"{"pipeline": [{"tool": "blur_faces"}, {"tool": "blur_plates", "args": {"kernel": 51}}]}"#
                    .to_string()
            } else {
                PLATES.to_string()
            })
        }));
        let manifest = f.planner.plan("blur faces and plates", None).await.unwrap();
        assert_eq!(manifest.pipeline[1].tool, "blur_license_plates");
        assert!(manifest.pipeline[1].generated);
        assert!(!manifest.pipeline[0].generated);
        assert!(f.registry.contains("blur_license_plates"));

        let generate_prompt = &f.llm.calls()[1][1].content;
        assert!(generate_prompt.contains("Tool name: blur_plates"));
        assert!(generate_prompt.contains("\"kernel\":51"));
    }

    #[tokio::test]
    async fn test_generation_failing_twice_is_planning_failure() {
        let f = fixture(ScriptedProvider::from_fn(|m| {
            Some(if is_planner_call(m) {
                r#"{"pipeline": [{"tool": "blur_plates"}]}"#.to_string()
            } else {
                "import socket\nname = 'blur_plates'\n".to_string()
            })
        }));
        let err = f.planner.plan("blur plates", None).await.unwrap_err();
        assert!(matches!(err, ShieldError::PlanningFailure(ref m) if m.contains("2 attempt")));
        assert_eq!(f.llm.call_count(), 3);
        assert!(!f.registry.contains("blur_plates"));

        let generate_failures = f
            .audit
            .entries()
            .iter()
            .filter(|e| e.stage == AuditStage::Generate && e.outcome == AuditOutcome::Fail)
            .count();
        assert_eq!(generate_failures, 2);
    }

    #[tokio::test]
    async fn test_unconventional_name_rejected() {
        let f = fixture(ScriptedProvider::new([r#"{"pipeline": [{"tool": "pixelate"}]}"#]));
        let err = f.planner.plan("pixelate everything", None).await.unwrap_err();
        assert!(matches!(err, ShieldError::PlanningFailure(_)));
        assert_eq!(f.llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_replan_prompt_carries_diagnostics() {
        let f = fixture(ScriptedProvider::new([
            r#"{"pipeline": [{"tool": "blur_faces", "args": {"detect_every": 1}}]}"#,
        ]));
        let mut metrics = Map::new();
        metrics.insert("miss_ratio".into(), serde_json::json!(0.25));
        let diag = DiagnosticContext {
            prior_manifest: Manifest::new(vec![Step::new("blur_faces")]),
            step: 0,
            tool: "blur_faces".into(),
            stage: "verify_detection".into(),
            category: "DetectionVerificationFailure".into(),
            reason: "miss ratio 0.250 not below 0.10".into(),
            metrics,
            args_tried: vec![Args::new()],
        };
        f.planner.plan("blur faces", Some(&diag)).await.unwrap();
        let user = &f.llm.calls()[0][1].content;
        assert!(user.contains("The previous pipeline failed"));
        assert!(user.contains("verify_detection"));
        assert!(user.contains("\"miss_ratio\":0.25"));
    }
}
