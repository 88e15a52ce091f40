use crate::error::RunFailure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Conda channel used when neither the CLI nor the settings file name one.
pub const DEFAULT_CONDA_CHANNEL: &str = "deadline-cloud";

/// Job bundle parameter carrying the conda channel to list.
pub const CONDA_CHANNEL_PARAMETER: &str = "CondaChannel";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub drain_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub log_timeout: Duration,
    /// Consecutive failed status queries tolerated before the run fails.
    #[serde(default)]
    pub status_retries: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(300),
            drain_delay: Duration::from_secs(5),
            log_timeout: Duration::from_secs(60),
            status_retries: 0,
        }
    }
}

/// A job bundle submission. Built once by the caller and consumed by one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    farm_id: String,
    queue_id: String,
    bundle_path: PathBuf,
    parameters: BTreeMap<String, String>,
}

impl JobSubmission {
    pub fn new(
        farm_id: impl Into<String>,
        queue_id: impl Into<String>,
        bundle_path: impl Into<PathBuf>,
        parameters: BTreeMap<String, String>,
    ) -> Result<Self, InvalidSubmission> {
        let farm_id = farm_id.into().trim().to_string();
        let queue_id = queue_id.into().trim().to_string();
        if farm_id.is_empty() || queue_id.is_empty() {
            return Err(InvalidSubmission::MissingIds);
        }
        if !farm_id.starts_with("farm-") {
            return Err(InvalidSubmission::FarmId(farm_id));
        }
        if !queue_id.starts_with("queue-") {
            return Err(InvalidSubmission::QueueId(queue_id));
        }
        Ok(Self {
            farm_id,
            queue_id,
            bundle_path: bundle_path.into(),
            parameters,
        })
    }

    pub fn farm_id(&self) -> &str {
        &self.farm_id
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn bundle_path(&self) -> &std::path::Path {
        &self.bundle_path
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSubmission {
    #[error("please select both a farm and a queue")]
    MissingIds,
    #[error("farm ID should start with 'farm-' (provided: {0})")]
    FarmId(String),
    #[error("queue ID should start with 'queue-' (provided: {0})")]
    QueueId(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
}

impl JobHandle {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.job_id)
    }
}

/// Coarse job state reported by the farm.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LifecycleStatus {
    CreateInProgress,
    CreateFailed,
    CreateComplete,
    UploadInProgress,
    UploadFailed,
    UpdateInProgress,
    UpdateFailed,
    UpdateSucceeded,
    Archived,
    Failed,
    Canceled,
    Other(String),
    #[default]
    Unknown,
}

impl LifecycleStatus {
    pub fn from_wire(s: &str) -> Self {
        match s.trim() {
            "" => Self::Unknown,
            "CREATE_IN_PROGRESS" => Self::CreateInProgress,
            "CREATE_FAILED" => Self::CreateFailed,
            "CREATE_COMPLETE" => Self::CreateComplete,
            "UPLOAD_IN_PROGRESS" => Self::UploadInProgress,
            "UPLOAD_FAILED" => Self::UploadFailed,
            "UPDATE_IN_PROGRESS" => Self::UpdateInProgress,
            "UPDATE_FAILED" => Self::UpdateFailed,
            "UPDATE_SUCCEEDED" => Self::UpdateSucceeded,
            "ARCHIVED" => Self::Archived,
            "FAILED" => Self::Failed,
            "CANCELED" => Self::Canceled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateFailed => "CREATE_FAILED",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::UploadInProgress => "UPLOAD_IN_PROGRESS",
            Self::UploadFailed => "UPLOAD_FAILED",
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::UpdateFailed => "UPDATE_FAILED",
            Self::UpdateSucceeded => "UPDATE_SUCCEEDED",
            Self::Archived => "ARCHIVED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Other(s) => s,
            Self::Unknown => "",
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Canceled | Self::CreateFailed | Self::UpdateFailed
        )
    }
}

/// Execution-level outcome of the job's tasks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskRunStatus {
    Pending,
    Ready,
    Assigned,
    Starting,
    Scheduled,
    Interrupting,
    Running,
    Suspended,
    Canceled,
    Failed,
    Succeeded,
    NotCompatible,
    Other(String),
    #[default]
    Unknown,
}

impl TaskRunStatus {
    pub fn from_wire(s: &str) -> Self {
        match s.trim() {
            "" => Self::Unknown,
            "PENDING" => Self::Pending,
            "READY" => Self::Ready,
            "ASSIGNED" => Self::Assigned,
            "STARTING" => Self::Starting,
            "SCHEDULED" => Self::Scheduled,
            "INTERRUPTING" => Self::Interrupting,
            "RUNNING" => Self::Running,
            "SUSPENDED" => Self::Suspended,
            "CANCELED" => Self::Canceled,
            "FAILED" => Self::Failed,
            "SUCCEEDED" => Self::Succeeded,
            "NOT_COMPATIBLE" => Self::NotCompatible,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Assigned => "ASSIGNED",
            Self::Starting => "STARTING",
            Self::Scheduled => "SCHEDULED",
            Self::Interrupting => "INTERRUPTING",
            Self::Running => "RUNNING",
            Self::Suspended => "SUSPENDED",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
            Self::Succeeded => "SUCCEEDED",
            Self::NotCompatible => "NOT_COMPATIBLE",
            Self::Other(s) => s,
            Self::Unknown => "",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }
}

/// Result of a single status poll. Only the latest one is kept.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobStatusSnapshot {
    pub lifecycle_status: LifecycleStatus,
    pub task_run_status: TaskRunStatus,
}

impl JobStatusSnapshot {
    pub fn new(lifecycle_status: LifecycleStatus, task_run_status: TaskRunStatus) -> Self {
        Self {
            lifecycle_status,
            task_run_status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareRecord {
    pub name: String,
    pub version: String,
    pub build: String,
    pub channel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Idle,
    Submitting,
    AwaitingJobId,
    Polling,
    DrainDelay,
    FetchingLogs,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

/// Events emitted by the engine and consumed by presentation layers.
///
/// A run's stream ends with exactly one `Completed` or `Failed`, unless the
/// run was stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status(String),
    Progress(u8),
    JobIdAssigned(String),
    Completed(String),
    Failed(RunFailure),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Completed(_) | ProgressEvent::Failed(_))
    }
}

/// Final outcome of a run task.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        job_id: String,
        raw_log: String,
    },
    Failed {
        job_id: Option<String>,
        failure: RunFailure,
    },
    /// Stopped by the caller; no terminal event was emitted.
    Stopped { job_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub id: String,
    pub name: String,
}
