//! Shield Engine Library
//!
//! Plans natural-language privacy requests into verified redaction pipelines
//! and executes them with closed-loop recovery. Used by the `shield` binary
//! and the integration tests.

/// Audio redaction engine
pub mod audio;

/// Append-only audit trail
pub mod audit;

/// CLI interface module
pub mod cli;

/// Configuration management module
pub mod config;

/// Pipeline executor and recovery policy
pub mod executor;

/// Bounded runs of external model commands
pub mod external;

/// Tool synthesis for capabilities the registry lacks
pub mod generator;

/// Command handlers module
pub mod handlers;

/// LLM provider abstraction layer
pub mod llm;

/// Wiring of the whole pipeline
pub mod pipeline;

/// Request to manifest planning
pub mod planner;

/// Tool registry
pub mod registry;

/// Telemetry and Observability
pub mod telemetry;

/// Privacy tools
pub mod tools;

/// Detection and transform verifiers
pub mod verify;

/// Video tracking and blurring engine
pub mod video;
