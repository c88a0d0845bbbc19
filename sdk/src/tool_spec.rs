//! Tool capability contracts

use serde::{Deserialize, Serialize};

/// What a tool does in a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Detector,
    Transform,
    Composite,
}

impl ToolKind {
    /// Infer the kind from a tool name
    ///
    /// `detect_*` is a detector; `blur`, `mute_segments` and similar
    /// single-purpose names are transforms; anything acting on a named
    /// target (`blur_faces`, `mute_keywords`) is a composite.
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("detect_") {
            Self::Detector
        } else if !name.contains('_') || name.ends_with("_segments") {
            Self::Transform
        } else {
            Self::Composite
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detector => "detector",
            Self::Transform => "transform",
            Self::Composite => "composite",
        }
    }

    /// Directory name generated tools of this kind are stored under
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Detector => "detectors",
            Self::Transform => "transforms",
            Self::Composite => "composites",
        }
    }
}

/// Where a tool came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    Builtin,
    Generated,
}

/// Registered capability contract
///
/// Immutable once registered. A new version needs a new name or an explicit
/// replace through the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
    /// Argument names the tool reads
    pub input_contract: Vec<String>,
    /// Summary keys the tool reports
    pub output_contract: Vec<String>,
    pub origin: ToolOrigin,
    /// BLAKE3 hex digest of the source for generated tools
    pub content_hash: Option<String>,
}

impl ToolSpec {
    pub fn builtin(name: impl Into<String>, kind: ToolKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            input_contract: Vec::new(),
            output_contract: Vec::new(),
            origin: ToolOrigin::Builtin,
            content_hash: None,
        }
    }

    pub fn generated(
        name: impl Into<String>,
        kind: ToolKind,
        description: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            input_contract: Vec::new(),
            output_contract: Vec::new(),
            origin: ToolOrigin::Generated,
            content_hash: Some(content_hash.into()),
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.input_contract = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.output_contract = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Identity used for idempotent registration
    ///
    /// Builtins have no source, so they are identified by name and kind.
    pub fn identity(&self) -> String {
        match &self.content_hash {
            Some(hash) => hash.clone(),
            None => format!("builtin:{}:{:?}", self.name, self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_name() {
        assert_eq!(ToolKind::from_name("detect_faces"), ToolKind::Detector);
        assert_eq!(ToolKind::from_name("detect_keywords"), ToolKind::Detector);
        assert_eq!(ToolKind::from_name("blur"), ToolKind::Transform);
        assert_eq!(ToolKind::from_name("mute_segments"), ToolKind::Transform);
        assert_eq!(ToolKind::from_name("blur_faces"), ToolKind::Composite);
        assert_eq!(ToolKind::from_name("mute_keywords"), ToolKind::Composite);
    }

    #[test]
    fn test_identity_uses_hash_when_present() {
        let a = ToolSpec::generated("blur_plates", ToolKind::Composite, "", "abc");
        let b = ToolSpec::builtin("blur", ToolKind::Transform, "");
        assert_eq!(a.identity(), "abc");
        assert_eq!(b.identity(), "builtin:blur:Transform");
    }

    #[test]
    fn test_spec_serialization() {
        let spec = ToolSpec::builtin("blur_faces", ToolKind::Composite, "Blur faces")
            .with_inputs(&["video_path", "kernel"]);
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"composite\""));
        assert!(json.contains("\"origin\":\"builtin\""));
        let back: ToolSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
