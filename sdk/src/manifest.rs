//! Pipeline manifest types
//!
//! A manifest is the ordered list of tool invocations produced by the planner.
//! The wire format is `{"pipeline": [{"tool": <name>, "args": {...}}, ...]}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ShieldError;

/// Ordered pipeline of steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub pipeline: Vec<Step>,
}

/// One tool invocation in a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Set by the planner when the tool was synthesized for this job
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub generated: bool,
}

impl Step {
    /// Create a step with no arguments
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Map::new(),
            generated: false,
        }
    }

    /// Add an argument
    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}

impl Manifest {
    pub fn new(pipeline: Vec<Step>) -> Self {
        Self { pipeline }
    }

    /// Parse manifest from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize manifest to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Names of all tools referenced, in pipeline order
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.pipeline.iter().map(|s| s.tool.as_str())
    }

    /// Structural validation
    ///
    /// An empty pipeline or a step without a tool name cannot be executed.
    pub fn validate(&self) -> Result<(), ShieldError> {
        if self.pipeline.is_empty() {
            return Err(ShieldError::MalformedManifest(
                "pipeline is empty".to_string(),
            ));
        }
        for (i, step) in self.pipeline.iter().enumerate() {
            let name = step.tool.trim();
            if name.is_empty() {
                return Err(ShieldError::MalformedManifest(format!(
                    "step {i} has no tool name"
                )));
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            {
                return Err(ShieldError::MalformedManifest(format!(
                    "step {i} tool name '{name}' is not snake_case"
                )));
            }
        }
        Ok(())
    }
}
