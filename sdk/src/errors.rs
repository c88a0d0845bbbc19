//! Error types and handling
//!
//! This module provides the error taxonomy used throughout the Shield engine.
//! All errors implement the `ShieldErrorExt` trait, which provides a user-facing
//! hint and the failure class that drives the executor's recovery policy.
//!
//! # Failure classes
//!
//! - **Retryable**: stage-local failures (verification thresholds not met,
//!   timeouts, tool crashes). Retried with substitutes up to a bound, then
//!   escalated to replanning.
//! - **Escalate**: generation failures. Reported back to the planner, never
//!   retried verbatim.
//! - **Fatal**: sandbox violations, malformed manifests, missing inputs and
//!   planning failures. The job aborts immediately.
//!
//! # Examples
//!
//! ```
//! use shield_sdk::errors::{FailureClass, ShieldError, ShieldErrorExt};
//!
//! let error = ShieldError::SandboxViolation("import of 'socket'".to_string());
//! assert_eq!(error.class(), FailureClass::Fatal);
//!
//! let retry = ShieldError::ExecutionTimeout { stage: "detect".into(), secs: 30 };
//! assert!(retry.is_recoverable());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the executor must react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retry locally with a substitute tool or adjusted arguments
    Retryable,
    /// Hand back to the planner; do not retry as-is
    Escalate,
    /// Abort the job immediately
    Fatal,
}

/// Trait for Shield error extensions
pub trait ShieldErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to show to end users and never contains paths,
    /// generated source, or model output.
    fn user_hint(&self) -> &str;

    /// Returns the recovery class of the error
    fn class(&self) -> FailureClass;

    /// Returns the short category name reported in structured failures
    fn category(&self) -> &'static str;

    /// Returns whether the error may be recovered from at all
    fn is_recoverable(&self) -> bool {
        self.class() != FailureClass::Fatal
    }
}

/// Main Shield error type
#[derive(Debug, Error)]
pub enum ShieldError {
    // Planning
    #[error("Planning failure: {0}")]
    PlanningFailure(String),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    // Generation
    #[error("Generation failure for '{tool}': {reason}")]
    GenerationFailure { tool: String, reason: String },

    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    // Registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Name collision: tool '{0}' is already registered with different content")]
    NameCollision(String),

    // Verification
    #[error("Detection verification failed: {0}")]
    DetectionVerificationFailure(String),

    #[error("Redaction verification failed: {0}")]
    RedactionVerificationFailure(String),

    #[error("Temporal integrity error: {0}")]
    TemporalIntegrityError(String),

    // Execution
    #[error("Stage '{stage}' timed out after {secs}s")]
    ExecutionTimeout { stage: String, secs: u64 },

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Missing input file: {0:?}")]
    MissingInput(std::path::PathBuf),

    #[error("Replanning limit reached after {0} replans")]
    ReplansExhausted(u32),

    #[error("Job cancelled")]
    Cancelled,

    // Collaborators
    #[error("LLM provider error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShieldErrorExt for ShieldError {
    fn user_hint(&self) -> &str {
        match self {
            Self::PlanningFailure(_) => "Could not turn the request into a pipeline. Try rephrasing it",
            Self::MalformedManifest(_) => "The generated pipeline was not valid",
            Self::GenerationFailure { .. } => "A required tool could not be generated",
            Self::SandboxViolation(_) => "A generated tool was rejected for safety reasons",
            Self::ToolNotFound(_) => "The requested tool is not available",
            Self::NameCollision(_) => "A different tool with the same name already exists",
            Self::DetectionVerificationFailure(_) => "Detection quality was too low to trust",
            Self::RedactionVerificationFailure(_) => "The redaction did not pass verification",
            Self::TemporalIntegrityError(_) => "Redaction segments were inconsistent",
            Self::ExecutionTimeout { .. } => "A processing stage took too long",
            Self::ToolExecution(_) => "A tool failed while processing the input",
            Self::MissingInput(_) => "The input file does not exist",
            Self::ReplansExhausted(_) => "All recovery attempts were used up",
            Self::Cancelled => "The job was cancelled",
            Self::Llm(_) => "Language model unavailable. Check your API key and network",
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn class(&self) -> FailureClass {
        match self {
            Self::SandboxViolation(_)
            | Self::MalformedManifest(_)
            | Self::MissingInput(_)
            | Self::NameCollision(_)
            | Self::PlanningFailure(_)
            | Self::ReplansExhausted(_)
            | Self::Cancelled
            | Self::Config(_) => FailureClass::Fatal,

            Self::GenerationFailure { .. } | Self::ToolNotFound(_) | Self::Llm(_) => {
                FailureClass::Escalate
            }

            Self::DetectionVerificationFailure(_)
            | Self::RedactionVerificationFailure(_)
            | Self::TemporalIntegrityError(_)
            | Self::ExecutionTimeout { .. }
            | Self::ToolExecution(_)
            | Self::Io(_) => FailureClass::Retryable,
        }
    }

    fn category(&self) -> &'static str {
        match self {
            Self::PlanningFailure(_) => "PlanningFailure",
            Self::MalformedManifest(_) => "MalformedManifest",
            Self::GenerationFailure { .. } => "GenerationFailure",
            Self::SandboxViolation(_) => "SandboxViolation",
            Self::ToolNotFound(_) => "ToolNotFound",
            Self::NameCollision(_) => "NameCollision",
            Self::DetectionVerificationFailure(_) => "DetectionVerificationFailure",
            Self::RedactionVerificationFailure(_) => "RedactionVerificationFailure",
            Self::TemporalIntegrityError(_) => "TemporalIntegrityError",
            Self::ExecutionTimeout { .. } => "ExecutionTimeout",
            Self::ToolExecution(_) => "ToolExecution",
            Self::MissingInput(_) => "MissingInput",
            Self::ReplansExhausted(_) => "ReplansExhausted",
            Self::Cancelled => "Cancelled",
            Self::Llm(_) => "LlmError",
            Self::Config(_) => "ConfigError",
            Self::Io(_) => "IoError",
        }
    }
}
