//! Job lifecycle data model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
///
/// Transitions are monotonic: `pending → running → {finished, error,
/// cancelled}`, with two shortcuts out of `pending` (cancelled before a
/// process ever started, or failed during startup reconciliation). A terminal
/// status is never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Finished,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    fn may_become(self, next: JobStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Running | Self::Cancelled | Self::Error
            ),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Input description needed to launch the external inference process.
///
/// The artifact reference is opaque: it is not resolved against the
/// filesystem at submission time. A missing artifact surfaces as an
/// execution-time error, not a submit-time rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationSpec {
    pub artifact: PathBuf,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

pub fn default_prompt() -> String {
    "<image>\nFree OCR.".to_string()
}

impl InvocationSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.artifact.as_os_str().is_empty() {
            return Err("artifact reference must not be empty".to_string());
        }
        if self.prompt.trim().is_empty() {
            return Err("prompt must not be empty".to_string());
        }
        Ok(())
    }

    fn source_file_name(&self, id: &str) -> String {
        self.artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string())
    }
}

/// Generate a fresh job identifier (8 hex chars of a UUIDv4).
pub fn new_job_id() -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[..8].to_string()
}

/// One submission and its lifecycle record. The durable projection of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    pub source_file_name: String,
    pub display_name: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl JobRecord {
    pub fn new(id: String, spec: &InvocationSpec) -> Self {
        let source_file_name = spec.source_file_name(&id);
        let display_name = spec
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| source_file_name.clone());

        Self {
            id,
            status: JobStatus::Pending,
            source_file_name,
            display_name,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            result_location: None,
            error_detail: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Advance the state machine, stamping `started_at`/`ended_at` on the
    /// corresponding transitions. Returns false (and changes nothing) if the
    /// transition is not legal from the current status.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.may_become(next) {
            return false;
        }
        self.status = next;
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        true
    }

    /// Wall-clock runtime, available once the job has both started and ended.
    pub fn runtime(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
