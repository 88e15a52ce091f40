//! Error types for talking to the farm and for failed job runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a [`crate::engine::FarmClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The `deadline` executable could not be started.
    #[error("Deadline CLI not found: {0}")]
    CliNotFound(String),

    #[error("I/O error running the Deadline CLI: {0}")]
    Io(#[from] std::io::Error),

    /// Non-zero exit from `deadline bundle submit`.
    #[error("Job submission failed: {0}")]
    Submission(String),

    /// Submit succeeded but no job identifier could be found in its output.
    #[error("Could not extract job ID from output: {0}")]
    MissingJobId(String),

    #[error("{0}")]
    StatusQuery(String),

    #[error("Failed to retrieve job logs: {0}")]
    LogRetrieval(String),

    #[error("Timeout while retrieving job logs")]
    LogTimeout,

    /// Farm or queue listing failed.
    #[error("Failed to load {what}: {message}")]
    Listing { what: &'static str, message: String },

    /// The CLI answered but its output could not be parsed.
    #[error("Failed to parse {what} data: {message}")]
    Malformed { what: &'static str, message: String },
}

/// Why a run ended in `Failed`. Carried by [`crate::model::ProgressEvent::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("{0}")]
    Submission(String),

    #[error("Status check failed: {0}")]
    StatusQuery(String),

    /// Remote-reported FAILED/CANCELED, e.g. "Tasks failed" or "Job create_failed".
    #[error("{0}")]
    TaskFailure(String),

    #[error("Job timeout - exceeded maximum wait time of {waited_secs}s")]
    Timeout { waited_secs: u64 },

    #[error("{0}")]
    LogRetrieval(String),
}

impl RunFailure {
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
