//! Tool Generator
//!
//! Synthesizes a missing capability against the fixed two-method contract
//! (`apply` / `verify`), screens the source, persists it under
//! `tools_dir/<kind>/<name>.py` and registers it as a [`ScriptTool`].
//!
//! Screening is a hard gate. A rejected candidate is reported back as a
//! `GenerationFailure` and never retried here; the planner decides what to
//! try next.

use regex::Regex;
use serde_json::Value;
use shield_sdk::errors::ShieldError;
use shield_sdk::tool_spec::{ToolKind, ToolSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GeneratorConfig;
use crate::llm::{complete_with_timeout, strip_code_fences, LLMProvider, Message};
use crate::registry::ToolRegistry;
use crate::tools::Args;

pub mod sandbox;
pub mod script_tool;

pub use sandbox::{SandboxScreen, ScreenRejection};
pub use script_tool::ScriptTool;

const SYSTEM_PROMPT: &str = "You generate Python privacy protection tools.

Requirements:
- Write one class that inherits from PrivacyTool (from tool_api) and sets `name`.
- Implement apply(self, **kwargs) returning {\"output_path\": ..., \"summary\": {...}}.
- Implement verify(self, **kwargs) returning {\"verified\": bool, \"details\": {...}}.
- apply receives `output_dir`, `input_path` and the step arguments as keyword
  arguments. Write every output file inside `output_dir`; never use absolute paths.
- End the module with `TOOL = YourTool()` and `register(TOOL)` (from registry).
- Only import these modules: {allowed}.
- Never use eval, exec, compile, __import__, getattr, globals, subprocess, os.popen,
  os.rename, shutil, sockets, network access, environment variables or the home directory.
- Build output paths from `output_dir` (for example os.path.join(output_dir, \"out.mp4\")).

Reply with the Python source only.";

/// Synthesizes, screens, persists and registers generated tools
pub struct ToolGenerator {
    llm: Arc<dyn LLMProvider>,
    registry: Arc<ToolRegistry>,
    screen: SandboxScreen,
    config: GeneratorConfig,
    llm_timeout: Duration,
    declared_name: Regex,
    /// Serializes write-then-register so concurrent jobs see one winner
    commit: Mutex<()>,
}

impl ToolGenerator {
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        registry: Arc<ToolRegistry>,
        config: GeneratorConfig,
        llm_timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            llm,
            registry,
            screen: SandboxScreen::new(&config.allowed_imports)?,
            config,
            llm_timeout,
            declared_name: Regex::new(r#"(?m)^\s*name\s*(?::\s*str\s*)?=\s*['"]([^'"]+)['"]"#)?,
            commit: Mutex::new(()),
        })
    }

    /// Generate and register the tool `name`
    ///
    /// `context` carries whatever arguments the planner already inferred. The
    /// returned spec may carry a different name than requested when the
    /// synthesized source declares one; callers must use the returned name.
    pub async fn generate(
        &self,
        name: &str,
        description: &str,
        context: &Args,
    ) -> Result<ToolSpec, ShieldError> {
        if let Some(spec) = self.registry.lookup(name) {
            debug!(tool = name, "Tool appeared before generation started");
            return Ok(spec);
        }

        let failure = |reason: String| ShieldError::GenerationFailure {
            tool: name.to_string(),
            reason,
        };

        let messages = self.prompt(name, description, context);
        let reply = complete_with_timeout(
            self.llm.as_ref(),
            &messages,
            false,
            self.llm_timeout,
            "generate",
        )
        .await
        .map_err(|e| failure(format!("synthesis failed: {}", e)))?;

        let source = strip_code_fences(&reply);
        if source.trim().is_empty() {
            return Err(failure("model returned no source".to_string()));
        }

        let actual = self.reconcile_name(name, &source).map_err(failure)?;

        self.screen
            .screen(&source)
            .map_err(|rejection| failure(format!("sandbox screen: {}", rejection)))?;

        let hash = blake3::hash(source.as_bytes()).to_hex().to_string();
        let kind = ToolKind::from_name(&actual);
        let inputs: Vec<&str> = context.keys().map(String::as_str).collect();
        let spec = ToolSpec::generated(&actual, kind, description, hash)
            .with_inputs(&inputs)
            .with_outputs(&["output_path"]);

        let _guard = self.commit.lock().await;
        if let Some(existing) = self.registry.lookup(&actual) {
            info!(tool = %actual, "Another job registered this tool first");
            return Ok(existing);
        }

        let path = self.source_path(kind, &actual);
        persist(&path, &source)?;
        self.registry.register(Arc::new(self.script_tool(spec.clone(), path.clone())))?;
        info!(
            tool = %actual,
            path = %path.display(),
            hash = spec.content_hash.as_deref().unwrap_or_default(),
            "Generated tool registered"
        );
        Ok(spec)
    }

    /// Re-register tools persisted by earlier runs
    ///
    /// Each source is screened again; rejected or unreadable files are
    /// skipped with a warning. Returns the names registered.
    pub fn restore(&self) -> Vec<String> {
        let mut restored = Vec::new();
        for kind in [ToolKind::Detector, ToolKind::Transform, ToolKind::Composite] {
            let dir = self.config.tools_dir.join(kind.dir_name());
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("py"))
                .collect();
            paths.sort();

            for path in paths {
                match self.restore_one(kind, &path) {
                    Ok(Some(name)) => restored.push(name),
                    Ok(None) => {}
                    Err(reason) => {
                        warn!(path = %path.display(), %reason, "Skipping persisted tool")
                    }
                }
            }
        }
        restored
    }

    fn restore_one(&self, kind: ToolKind, path: &Path) -> Result<Option<String>, String> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or("unnamed file")?
            .to_string();
        if self.registry.contains(&name) {
            return Ok(None);
        }
        if !follows_convention(&name) {
            return Err(format!("'{}' does not follow the naming convention", name));
        }
        let source = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        self.screen.screen(&source).map_err(|r| r.to_string())?;
        let hash = blake3::hash(source.as_bytes()).to_hex().to_string();
        let spec = ToolSpec::generated(&name, kind, "restored generated tool", hash)
            .with_outputs(&["output_path"]);
        self.registry
            .register(Arc::new(self.script_tool(spec, path.to_path_buf())))
            .map_err(|e| e.to_string())?;
        Ok(Some(name))
    }

    fn prompt(&self, name: &str, description: &str, context: &Args) -> Vec<Message> {
        let system = SYSTEM_PROMPT.replace("{allowed}", &self.config.allowed_imports.join(", "));
        let related = self.registry.names().join(", ");
        let mut user = format!("Tool name: {}\nCapability: {}\n", name, description);
        if !context.is_empty() {
            user.push_str(&format!(
                "Arguments already chosen: {}\n",
                Value::Object(context.clone())
            ));
        }
        if !related.is_empty() {
            user.push_str(&format!("Related existing tools: {}\n", related));
        }
        vec![Message::system(system), Message::user(user)]
    }

    /// The name the source declares, which wins over the requested one
    fn reconcile_name(&self, requested: &str, source: &str) -> Result<String, String> {
        let declared = self
            .declared_name
            .captures(source)
            .map(|c| c[1].trim().to_string())
            .ok_or_else(|| "source declares no tool name".to_string())?;
        if !is_tool_name(&declared) {
            return Err(format!("declared name '{}' is not snake_case", declared));
        }
        if !follows_convention(&declared) {
            return Err(format!(
                "declared name '{}' does not follow the naming convention",
                declared
            ));
        }
        if declared != requested {
            info!(requested, declared = %declared, "Generated tool declares a different name");
        }
        Ok(declared)
    }

    fn source_path(&self, kind: ToolKind, name: &str) -> PathBuf {
        self.config
            .tools_dir
            .join(kind.dir_name())
            .join(format!("{}.py", name))
    }

    fn script_tool(&self, spec: ToolSpec, path: PathBuf) -> ScriptTool {
        ScriptTool::new(
            spec,
            path,
            self.config.interpreter.clone(),
            Duration::from_secs(self.config.tool_timeout_secs),
        )
    }
}

/// `detect_<object>`, `blur_<object>` or `<action>_<target>`
pub fn follows_convention(name: &str) -> bool {
    match name.split_once('_') {
        Some((action, target)) => !action.is_empty() && !target.is_empty() && !target.starts_with('_'),
        None => false,
    }
}

fn is_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn persist(path: &Path, source: &str) -> Result<(), ShieldError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, source)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;
    use shield_sdk::tool_spec::ToolOrigin;

    const PLATES: &str = "```python
from tool_api import PrivacyTool
from registry import register
import cv2

class BlurPlates(PrivacyTool):
    name = \"blur_plates\"

    def apply(self, output_dir, **kwargs):
        return {\"output_path\": output_dir + \"/plates.mp4\", \"summary\": {}}

    def verify(self, **kwargs):
        return {\"verified\": True}

TOOL = BlurPlates()
register(TOOL)
```";

    fn config(root: &Path) -> GeneratorConfig {
        GeneratorConfig {
            tools_dir: root.join("tools"),
            ..GeneratorConfig::default()
        }
    }

    fn generator(
        llm: Arc<ScriptedProvider>,
        registry: Arc<ToolRegistry>,
        root: &Path,
    ) -> ToolGenerator {
        ToolGenerator::new(llm, registry, config(root), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_generates_persists_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let llm = Arc::new(ScriptedProvider::new([PLATES]));
        let gen = generator(llm, Arc::clone(&registry), dir.path());

        let spec = gen
            .generate("blur_plates", "Blur license plates", &Args::new())
            .await
            .unwrap();
        assert_eq!(spec.name, "blur_plates");
        assert_eq!(spec.kind, ToolKind::Composite);
        assert_eq!(spec.origin, ToolOrigin::Generated);

        let path = dir.path().join("tools/composites/blur_plates.py");
        let source = std::fs::read_to_string(&path).unwrap();
        assert!(!source.contains("```"));
        assert_eq!(
            spec.content_hash.as_deref(),
            Some(blake3::hash(source.as_bytes()).to_hex().as_str())
        );
        assert!(registry.contains("blur_plates"));
    }

    #[tokio::test]
    async fn test_screen_failure_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let bad = PLATES.replace("import cv2", "import socket");
        let gen = generator(
            Arc::new(ScriptedProvider::new([bad])),
            Arc::clone(&registry),
            dir.path(),
        );

        let err = gen
            .generate("blur_plates", "Blur license plates", &Args::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShieldError::GenerationFailure { ref reason, .. } if reason.contains("sandbox")));
        assert!(!registry.contains("blur_plates"));
        assert!(!dir.path().join("tools/composites/blur_plates.py").exists());
    }

    #[tokio::test]
    async fn test_declared_name_wins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let gen = generator(
            Arc::new(ScriptedProvider::new([PLATES])),
            Arc::clone(&registry),
            dir.path(),
        );
        let spec = gen
            .generate("blur_plate", "Blur license plates", &Args::new())
            .await
            .unwrap();
        assert_eq!(spec.name, "blur_plates");
        assert!(!registry.contains("blur_plate"));
    }

    #[tokio::test]
    async fn test_unconventional_declared_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let gen = generator(
            Arc::new(ScriptedProvider::new([PLATES.replace("\"blur_plates\"", "\"pixelate\"")])),
            Arc::clone(&registry),
            dir.path(),
        );
        let err = gen
            .generate("blur_plates", "Blur license plates", &Args::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShieldError::GenerationFailure { ref reason, .. } if reason.contains("naming convention")));
        assert!(!registry.contains("pixelate"));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_naming_convention() {
        assert!(follows_convention("detect_license_plates"));
        assert!(follows_convention("transcribe_audio"));
        assert!(!follows_convention("pixelate"));
        assert!(!follows_convention("blur_"));
        assert!(!follows_convention("_plates"));
    }

    #[tokio::test]
    async fn test_missing_name_and_llm_error_are_generation_failures() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let gen = generator(
            Arc::new(ScriptedProvider::new(["import cv2\nprint('hi')\n"])),
            Arc::clone(&registry),
            dir.path(),
        );
        let err = gen.generate("blur_x", "", &Args::new()).await.unwrap_err();
        assert!(matches!(err, ShieldError::GenerationFailure { .. }));

        // Script exhausted
        let err = gen.generate("blur_x", "", &Args::new()).await.unwrap_err();
        assert!(matches!(err, ShieldError::GenerationFailure { .. }));
    }

    #[tokio::test]
    async fn test_existing_tool_skips_model() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let llm = Arc::new(ScriptedProvider::new([PLATES]));
        let gen = generator(Arc::clone(&llm), Arc::clone(&registry), dir.path());
        gen.generate("blur_plates", "", &Args::new()).await.unwrap();
        gen.generate("blur_plates", "", &Args::new()).await.unwrap();
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_generation_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let llm = Arc::new(ScriptedProvider::from_fn(|_| Some(PLATES.to_string())));
        let gen = Arc::new(generator(llm, Arc::clone(&registry), dir.path()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = Arc::clone(&gen);
                tokio::spawn(async move { gen.generate("blur_plates", "", &Args::new()).await })
            })
            .collect();
        let mut hashes = Vec::new();
        for h in handles {
            hashes.push(h.await.unwrap().unwrap().content_hash);
        }
        hashes.dedup();
        assert_eq!(hashes.len(), 1);
        assert_eq!(registry.names(), vec!["blur_plates"]);
    }

    #[tokio::test]
    async fn test_restore_rescreens_sources() {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("tools");
        std::fs::create_dir_all(tools.join("detectors")).unwrap();
        std::fs::create_dir_all(tools.join("transforms")).unwrap();
        std::fs::write(
            tools.join("detectors/detect_plates.py"),
            PLATES.replace("```python", "").replace("```", ""),
        )
        .unwrap();
        std::fs::write(tools.join("transforms/evil.py"), "import socket\n").unwrap();

        let registry = Arc::new(ToolRegistry::new());
        let gen = generator(
            Arc::new(ScriptedProvider::new(Vec::<String>::new())),
            Arc::clone(&registry),
            dir.path(),
        );
        assert_eq!(gen.restore(), vec!["detect_plates".to_string()]);
        assert_eq!(
            registry.lookup("detect_plates").unwrap().kind,
            ToolKind::Detector
        );
        assert!(!registry.contains("evil"));
    }
}
