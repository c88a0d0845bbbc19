//! Out-of-process execution of generated tools
//!
//! A generated tool never runs inside the engine. Each call spawns the
//! configured interpreter with a small runner that stubs the `tool_api` and
//! `registry` modules, loads the tool source, and answers one JSON request
//! read from stdin. The response is the last stdout line carrying the result
//! marker, so tools may print freely.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shield_sdk::errors::ShieldError;
use shield_sdk::tool_spec::ToolSpec;
use shield_sdk::types::{ApplyOutput, VerifyOutput};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::tools::{Args, Detection, PrivacyTool, StageContext};

const RESULT_MARKER: &str = "__SHIELD_RESULT__";

const RUNNER: &str = r#"
import importlib.util, json, sys, types

class PrivacyTool:
    name = None
    def apply(self, **kwargs):
        raise NotImplementedError
    def verify(self, **kwargs):
        raise NotImplementedError

TOOLS = {}
def register(tool):
    TOOLS[tool.name] = tool

api = types.ModuleType("tool_api")
api.PrivacyTool = PrivacyTool
reg = types.ModuleType("registry")
reg.register = register
reg.get = TOOLS.get
sys.modules["tool_api"] = api
sys.modules["registry"] = reg

request = json.load(sys.stdin)
spec = importlib.util.spec_from_file_location("generated_tool", sys.argv[1])
module = importlib.util.module_from_spec(spec)
spec.loader.exec_module(module)
tool = getattr(module, "TOOL", None) or next(iter(TOOLS.values()), None)
if tool is None:
    sys.stderr.write("no tool registered by source\n")
    sys.exit(2)

kwargs = dict(request.get("args") or {})
kwargs["output_dir"] = request["output_dir"]
if request.get("input_path"):
    kwargs.setdefault("input_path", request["input_path"])
if request["method"] == "apply":
    result = tool.apply(**kwargs)
else:
    result = tool.verify(**kwargs)
if not isinstance(result, dict):
    result = {}
sys.stdout.write("\n__SHIELD_RESULT__" + json.dumps(result, default=str) + "\n")
"#;

/// Request written to the runner's stdin
#[derive(Debug, Serialize)]
struct ToolRequest<'a> {
    method: &'a str,
    input_path: Option<String>,
    args: &'a Args,
    output_dir: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApplyResponse {
    #[serde(default)]
    output_path: Option<String>,
    #[serde(default)]
    summary: Map<String, Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    verified: bool,
    #[serde(default)]
    details: Map<String, Value>,
}

/// A generated tool bound to its persisted source
pub struct ScriptTool {
    spec: ToolSpec,
    source: PathBuf,
    interpreter: String,
    timeout: Duration,
}

impl ScriptTool {
    pub fn new(spec: ToolSpec, source: PathBuf, interpreter: String, timeout: Duration) -> Self {
        Self {
            spec,
            source,
            interpreter,
            timeout,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    async fn call(&self, method: &str, ctx: &StageContext, args: &Args) -> Result<Value, ShieldError> {
        ctx.check_cancelled()?;
        std::fs::create_dir_all(&ctx.output_dir)?;

        let input_path = ["video_path", "audio_path", "input_path"]
            .iter()
            .find_map(|k| args.get(*k).and_then(|v| v.as_str()).map(String::from));
        let request = ToolRequest {
            method,
            input_path,
            args,
            output_dir: ctx.output_dir.to_string_lossy().into_owned(),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ShieldError::ToolExecution(format!("request encoding: {}", e)))?;

        info!(tool = %self.spec.name, method, attempt = ctx.attempt, "Invoking generated tool");
        let mut child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(RUNNER)
            .arg(&self.source)
            .current_dir(&ctx.output_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ShieldError::ToolExecution(format!("spawn {} failed: {}", self.interpreter, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ShieldError::ExecutionTimeout {
                stage: format!("{}.{}", self.spec.name, method),
                secs: self.timeout.as_secs(),
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            warn!(tool = %self.spec.name, code = ?output.status.code(), "Generated tool exited with failure");
            return Err(ShieldError::ToolExecution(format!(
                "{} exited with {:?}: {}",
                self.spec.name,
                output.status.code(),
                last_lines(&stderr, 5)
            )));
        }
        debug!(tool = %self.spec.name, stderr = %last_lines(&stderr, 3), "Generated tool finished");
        parse_result(&stdout)
    }
}

/// The JSON payload on the last marker line
fn parse_result(stdout: &str) -> Result<Value, ShieldError> {
    let line = stdout
        .lines()
        .rev()
        .find_map(|l| l.strip_prefix(RESULT_MARKER))
        .ok_or_else(|| ShieldError::ToolExecution("generated tool produced no result".to_string()))?;
    serde_json::from_str(line)
        .map_err(|e| ShieldError::ToolExecution(format!("unparseable tool result: {}", e)))
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join(" | ")
}

/// Resolve a reported output path, rejecting anything outside `output_dir`
pub fn confine(output_dir: &Path, reported: &str) -> Result<PathBuf, ShieldError> {
    let candidate = Path::new(reported);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        output_dir.join(candidate)
    };
    if joined.components().any(|c| c == Component::ParentDir) {
        return Err(ShieldError::SandboxViolation(format!(
            "output path '{}' escapes the output directory",
            reported
        )));
    }

    let root = output_dir.canonicalize().unwrap_or_else(|_| output_dir.to_path_buf());
    let resolved = joined.canonicalize().unwrap_or_else(|_| joined.clone());
    if resolved.starts_with(&root) || joined.starts_with(output_dir) {
        Ok(joined)
    } else {
        Err(ShieldError::SandboxViolation(format!(
            "output path '{}' is outside the output directory",
            reported
        )))
    }
}

#[async_trait]
impl PrivacyTool for ScriptTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn apply(
        &self,
        ctx: &StageContext,
        args: &Args,
        _detection: Option<&Detection>,
    ) -> Result<ApplyOutput, ShieldError> {
        let raw = self.call("apply", ctx, args).await?;
        let response: ApplyResponse = serde_json::from_value(raw)
            .map_err(|e| ShieldError::ToolExecution(format!("bad apply result: {}", e)))?;

        // Older tools report `{"video_path": ...}` instead of `output_path`
        let reported = response
            .output_path
            .or_else(|| {
                response
                    .rest
                    .iter()
                    .filter(|(k, _)| k.ends_with("_path"))
                    .find_map(|(_, v)| v.as_str().map(String::from))
            })
            .ok_or_else(|| {
                ShieldError::ToolExecution(format!("{} returned no output path", self.spec.name))
            })?;

        let path = confine(&ctx.output_dir, &reported)?;
        let mut out = ApplyOutput::new(path);
        out.summary = response.summary;
        Ok(out)
    }

    async fn verify(
        &self,
        ctx: &StageContext,
        args: &Args,
        output: &ApplyOutput,
        _detection: Option<&Detection>,
    ) -> Result<VerifyOutput, ShieldError> {
        let mut args = args.clone();
        args.insert(
            "output_path".to_string(),
            Value::String(output.output_path.to_string_lossy().into_owned()),
        );
        let raw = self.call("verify", ctx, &args).await?;
        let response: VerifyResponse = serde_json::from_value(raw).unwrap_or_default();
        let mut out = if response.verified {
            VerifyOutput::pass()
        } else {
            VerifyOutput::fail(format!("{} reported verification failure", self.spec.name))
        };
        out.details.extend(response.details);
        Ok(out)
    }
}
