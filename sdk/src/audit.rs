//! Audit trail records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Plan,
    Generate,
    Execute,
    Verify,
    Recover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok,
    Fail,
}

/// One append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: AuditStage,
    pub outcome: AuditOutcome,
    pub detail: String,
    /// Job the entry belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl AuditEntry {
    pub fn new(stage: AuditStage, outcome: AuditOutcome, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stage,
            outcome,
            detail: detail.into(),
            job_id: None,
        }
    }

    pub fn ok(stage: AuditStage, detail: impl Into<String>) -> Self {
        Self::new(stage, AuditOutcome::Ok, detail)
    }

    pub fn fail(stage: AuditStage, detail: impl Into<String>) -> Self {
        Self::new(stage, AuditOutcome::Fail, detail)
    }

    pub fn for_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}
