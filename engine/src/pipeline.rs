//! Shield pipeline
//!
//! Wires configuration, the language model, the tool registry, the generator,
//! the planner and the executor into one handle the CLI and tests drive.

use anyhow::Context;
use shield_sdk::errors::ShieldError;
use shield_sdk::manifest::Manifest;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::{ProcessTranscriber, Transcriber, UnconfiguredTranscriber};
use crate::audit::{AuditSink, JsonlAuditSink};
use crate::config::Config;
use crate::executor::{Executor, ExecutorSettings, Job, JobFailure, JobOutcome};
use crate::generator::ToolGenerator;
use crate::llm::{LLMProvider, OpenAICompatProvider};
use crate::planner::Planner;
use crate::registry::ToolRegistry;
use crate::tools::{builtin_tools, ToolDeps};
use crate::video::{FaceDetector, NoDetector, ProcessDetector};

/// Collaborators a `Shield` can be built with instead of the configured ones
#[derive(Default)]
pub struct Overrides {
    pub llm: Option<Arc<dyn LLMProvider>>,
    pub detector: Option<Arc<dyn FaceDetector>>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub audit: Option<Arc<dyn AuditSink>>,
}

pub struct Shield {
    config: Arc<Config>,
    registry: Arc<ToolRegistry>,
    planner: Arc<Planner>,
    executor: Executor,
}

impl Shield {
    /// Build from configuration alone
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_overrides(config, Overrides::default())
    }

    pub fn with_overrides(config: Config, overrides: Overrides) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let llm_timeout = Duration::from_secs(config.llm.timeout_secs);

        let llm = match overrides.llm {
            Some(llm) => llm,
            None => Arc::new(OpenAICompatProvider::new(&config.llm)) as Arc<dyn LLMProvider>,
        };
        let stage_secs = config.executor.stage_timeout_secs;
        let detector_timeout =
            Duration::from_secs(config.video.detector_timeout_secs.min(stage_secs));
        let transcriber_timeout =
            Duration::from_secs(config.audio.transcriber_timeout_secs.min(stage_secs));
        let detector: Arc<dyn FaceDetector> = match overrides.detector {
            Some(d) => d,
            None if config.video.detector_command.is_empty() => {
                warn!(
                    "No face detector configured; face detection will fail until video.detector_command is set"
                );
                Arc::new(NoDetector)
            }
            None => Arc::new(
                ProcessDetector::new(
                    config.video.detector_command.clone(),
                    config.core.work_dir.join("detector"),
                    detector_timeout,
                )
                .map_err(ShieldError::from)?,
            ),
        };
        let transcriber: Arc<dyn Transcriber> = match overrides.transcriber {
            Some(t) => t,
            None if config.audio.transcriber_command.is_empty() => Arc::new(UnconfiguredTranscriber),
            None => Arc::new(
                ProcessTranscriber::new(
                    config.audio.transcriber_command.clone(),
                    config.core.work_dir.join("transcriber"),
                    transcriber_timeout,
                )
                .map_err(ShieldError::from)?,
            ),
        };
        let audit: Arc<dyn AuditSink> = match overrides.audit {
            Some(a) => a,
            None => Arc::new(
                JsonlAuditSink::new(&config.core.audit_log)
                    .with_context(|| format!("opening audit log {}", config.core.audit_log.display()))?,
            ),
        };

        let registry = Arc::new(ToolRegistry::new());
        let deps = ToolDeps {
            config: Arc::clone(&config),
            llm: Arc::clone(&llm),
            detector,
            transcriber,
        };
        registry.register_all(builtin_tools(&deps))?;

        let generator = Arc::new(ToolGenerator::new(
            Arc::clone(&llm),
            Arc::clone(&registry),
            config.generator.clone(),
            llm_timeout,
        )?);
        let restored = generator.restore();
        if !restored.is_empty() {
            info!(count = restored.len(), tools = ?restored, "Restored generated tools");
        }

        let planner = Arc::new(Planner::new(
            llm,
            Arc::clone(&registry),
            generator,
            Arc::clone(&audit),
            llm_timeout,
            config.generator.max_attempts,
        ));
        let executor = Executor::new(
            Arc::clone(&registry),
            Arc::clone(&planner),
            audit,
            ExecutorSettings::from(config.as_ref()),
        );

        Ok(Self {
            config,
            registry,
            planner,
            executor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Plan `user_text` without executing anything
    pub async fn plan(&self, user_text: &str) -> Result<Manifest, ShieldError> {
        self.planner.plan(user_text, None).await
    }

    /// Plan and execute `user_text` against `input`
    pub async fn run(&self, user_text: &str, input: &Path) -> Result<JobOutcome, JobFailure> {
        self.run_job(&Job::new(user_text, input)).await
    }

    /// Plan and execute a job whose cancellation token the caller holds
    pub async fn run_job(&self, job: &Job) -> Result<JobOutcome, JobFailure> {
        info!(job = %job.id, input = %job.input.display(), "Job received");
        // Planning a request whose input is missing would only waste a model call
        if !job.input.exists() {
            let error = ShieldError::MissingInput(job.input.clone());
            return Err(JobFailure::from_error(&job.id, "input", &error, Vec::new()));
        }

        let planned = tokio::select! {
            _ = job.cancel.cancelled() => Err(ShieldError::Cancelled),
            r = self.planner.plan(&job.user_text, None) => r,
        };
        let manifest = match planned {
            Ok(m) => m,
            Err(e) => return Err(JobFailure::from_error(&job.id, "plan", &e, Vec::new())),
        };
        self.executor.execute(job, manifest).await
    }
}
