//! Tool input/output types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Result of a tool's `apply` method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutput {
    pub output_path: PathBuf,
    #[serde(default)]
    pub summary: Map<String, Value>,
}

impl ApplyOutput {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            summary: Map::new(),
        }
    }

    /// Add a summary entry
    pub fn with_summary(mut self, key: impl Into<String>, value: Value) -> Self {
        self.summary.insert(key.into(), value);
        self
    }

    /// Look up a field by name for `$prev.<field>` references
    ///
    /// `output_path` resolves to the artifact path, anything else to the
    /// summary entry of the same name.
    pub fn field(&self, name: &str) -> Option<Value> {
        if name == "output_path" {
            return Some(Value::String(self.output_path.to_string_lossy().into_owned()));
        }
        self.summary.get(name).cloned()
    }
}

/// Result of a tool's `verify` method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyOutput {
    pub verified: bool,
    /// Metrics and reasons, surfaced in diagnostics on failure
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl VerifyOutput {
    pub fn pass() -> Self {
        Self {
            verified: true,
            details: Map::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        let mut details = Map::new();
        details.insert("reason".to_string(), Value::String(reason.into()));
        Self {
            verified: false,
            details,
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Failure reason, if one was recorded
    pub fn reason(&self) -> Option<&str> {
        self.details.get("reason").and_then(|v| v.as_str())
    }
}

/// Typed accessors over a step's argument map
pub trait ToolArgs {
    fn param_str(&self, key: &str) -> Result<String, ToolError>;
    fn param_str_opt(&self, key: &str) -> Option<String>;
    fn param_f64_opt(&self, key: &str) -> Option<f64>;
    fn param_u64_opt(&self, key: &str) -> Option<u64>;
    fn param_bool_opt(&self, key: &str) -> Option<bool>;
    fn param_path(&self, key: &str) -> Result<PathBuf, ToolError>;
    fn param_str_list(&self, key: &str) -> Option<Vec<String>>;
}

impl ToolArgs for Map<String, Value> {
    fn param_str(&self, key: &str) -> Result<String, ToolError> {
        self.param_str_opt(key)
            .ok_or_else(|| ToolError::MissingParameter(key.to_string()))
    }

    fn param_str_opt(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str()).map(String::from)
    }

    fn param_f64_opt(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    fn param_u64_opt(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    fn param_bool_opt(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    fn param_path(&self, key: &str) -> Result<PathBuf, ToolError> {
        let raw = self.param_str(key)?;
        if raw.is_empty() {
            return Err(ToolError::InvalidParameter(format!("{key} is empty")));
        }
        Ok(PathBuf::from(raw))
    }

    fn param_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
            ),
            Value::String(s) => Some(vec![s.clone()]),
            _ => None,
        }
    }
}

/// Kind of input file a job operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
}

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv", "flv"];
const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "aac", "ogg", "m4a"];

impl MediaKind {
    /// Classify an input path by extension
    ///
    /// A directory is treated as a video frame sequence.
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(Self::Video);
        }
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Audio)
        } else {
            None
        }
    }

    /// Argument name the executor injects for this media kind
    pub fn arg_name(self) -> &'static str {
        match self {
            Self::Video => "video_path",
            Self::Audio => "audio_path",
        }
    }
}

/// Tool-specific errors
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),
}

impl From<ToolError> for crate::errors::ShieldError {
    fn from(e: ToolError) -> Self {
        crate::errors::ShieldError::ToolExecution(e.to_string())
    }
}
