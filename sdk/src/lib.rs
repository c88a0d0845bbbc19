//! Shield SDK
//!
//! Shared contract types for the Shield engine and for out-of-process
//! generated tools: the pipeline manifest, tool specs, tool input/output
//! shapes, audit records and the error taxonomy.

/// Audit trail records
pub mod audit;

/// Error types and handling
pub mod errors;

/// Pipeline manifest types
pub mod manifest;

/// Tool capability contracts
pub mod tool_spec;

/// Tool input/output types
pub mod types;

// Re-export commonly used types
pub use audit::{AuditEntry, AuditOutcome, AuditStage};
pub use errors::{FailureClass, ShieldError, ShieldErrorExt};
pub use manifest::{Manifest, Step};
pub use tool_spec::{ToolKind, ToolOrigin, ToolSpec};
pub use types::{ApplyOutput, MediaKind, ToolArgs, ToolError, VerifyOutput};
