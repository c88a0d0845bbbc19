//! Command handlers for CLI operations
//!
//! - run: plan and execute a request against a media file
//! - plan: print the manifest a request would run
//! - tools: list the registered catalogue

use anyhow::Result;
use serde_json::json;
use shield_sdk::tool_spec::ToolOrigin;
use std::path::Path;

use crate::executor::Job;
use crate::pipeline::Shield;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Plan and execute `request` against `input`
///
/// Ctrl-C cancels the job; nothing is committed for a cancelled job.
pub async fn handle_run(
    shield: &Shield,
    request: &str,
    input: &Path,
    format: OutputFormat,
) -> Result<()> {
    let job = Job::new(request, input);
    let cancel = job.cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling job");
            cancel.cancel();
        }
    });

    let result = shield.run_job(&job).await;
    watcher.abort();

    match (result, format) {
        (Ok(outcome), OutputFormat::Json) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        (Ok(outcome), OutputFormat::Text) => {
            println!("Job {} committed", outcome.job_id);
            println!("  Output:  {}", outcome.output_path.display());
            println!("  Steps:   {}", outcome.manifest.tool_names().collect::<Vec<_>>().join(" -> "));
            if outcome.replans > 0 {
                println!("  Replans: {}", outcome.replans);
            }
            Ok(())
        }
        (Err(failure), OutputFormat::Json) => {
            println!("{}", serde_json::to_string_pretty(&failure)?);
            Err(failure.into())
        }
        (Err(failure), OutputFormat::Text) => {
            eprintln!("Job {} aborted", failure.job_id);
            eprintln!("  Stage:    {}", failure.stage);
            eprintln!("  Category: {}", failure.category);
            eprintln!("  Detail:   {}", failure.detail);
            eprintln!("  Hint:     {}", failure.hint);
            for (i, diag) in failure.diagnostics.iter().enumerate() {
                eprintln!("  Replan {}: {} failed in {}: {}", i + 1, diag.tool, diag.stage, diag.reason);
            }
            Err(failure.into())
        }
    }
}

/// Print the manifest `request` plans to
pub async fn handle_plan(shield: &Shield, request: &str, format: OutputFormat) -> Result<()> {
    let manifest = shield.plan(request).await?;
    match format {
        OutputFormat::Json => println!("{}", manifest.to_json()?),
        OutputFormat::Text => {
            for (i, step) in manifest.pipeline.iter().enumerate() {
                let marker = if step.generated { " (generated)" } else { "" };
                println!("{}. {}{} {}", i + 1, step.tool, marker, serde_json::Value::Object(step.args.clone()));
            }
        }
    }
    Ok(())
}

/// List registered tools
pub fn handle_tools(shield: &Shield, format: OutputFormat) -> Result<()> {
    let specs = shield.registry().specs();
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "tools": specs }))?);
        }
        OutputFormat::Text => {
            println!("Registered tools ({}):", specs.len());
            for spec in &specs {
                let origin = match spec.origin {
                    ToolOrigin::Builtin => "builtin",
                    ToolOrigin::Generated => "generated",
                };
                println!("  {:<24} {:<10} {:<10} {}", spec.name, spec.kind.as_str(), origin, spec.description);
            }
        }
    }
    Ok(())
}
