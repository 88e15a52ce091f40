//! `FarmClient` backed by the AWS Deadline Cloud CLI.
//!
//! Every call shells out to `deadline ...` and parses its YAML output. Missing
//! fields degrade to empty/unknown values rather than errors.

use super::FarmClient;
use crate::error::ClientError;
use crate::model::{
    FarmSummary, JobHandle, JobStatusSnapshot, JobSubmission, LifecycleStatus, QueueSummary,
    TaskRunStatus,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Characters of raw submit output kept in a missing-job-id diagnostic.
const DIAGNOSTIC_CHARS: usize = 200;

static JOB_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)job-[a-f0-9]+").unwrap());

#[derive(Debug, Clone)]
pub struct DeadlineCli {
    program: PathBuf,
    log_timeout: Duration,
}

impl DeadlineCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            log_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_log_timeout(mut self, log_timeout: Duration) -> Self {
        self.log_timeout = log_timeout;
        self
    }

    async fn output<I, S>(&self, args: I) -> Result<Output, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        tracing::debug!(program = %self.program.display(), ?args, "running deadline CLI");
        Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ClientError::CliNotFound(self.program.display().to_string())
                }
                _ => ClientError::Io(e),
            })
    }

    /// `deadline farm list`
    pub async fn list_farms(&self) -> Result<Vec<FarmSummary>, ClientError> {
        let out = self.output(["farm", "list"]).await?;
        if !out.status.success() {
            return Err(ClientError::Listing {
                what: "farms",
                message: stderr_text(&out),
            });
        }
        let entries = parse_listing(&String::from_utf8_lossy(&out.stdout), "farms", "farmId")?;
        Ok(entries
            .into_iter()
            .map(|(id, name)| FarmSummary { id, name })
            .collect())
    }

    /// `deadline queue list --farm-id <farm>`
    pub async fn list_queues(&self, farm_id: &str) -> Result<Vec<QueueSummary>, ClientError> {
        let out = self
            .output(["queue", "list", "--farm-id", farm_id])
            .await?;
        if !out.status.success() {
            return Err(ClientError::Listing {
                what: "queues",
                message: stderr_text(&out),
            });
        }
        let entries = parse_listing(&String::from_utf8_lossy(&out.stdout), "queues", "queueId")?;
        Ok(entries
            .into_iter()
            .map(|(id, name)| QueueSummary { id, name })
            .collect())
    }

    /// `deadline --version`, trimmed stdout.
    pub async fn version(&self) -> Result<String, ClientError> {
        let out = self.output(["--version"]).await?;
        if !out.status.success() {
            return Err(ClientError::Listing {
                what: "CLI version",
                message: stderr_text(&out),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

impl FarmClient for DeadlineCli {
    async fn submit(&self, submission: &JobSubmission) -> Result<JobHandle, ClientError> {
        let mut args: Vec<OsString> = vec![
            "bundle".into(),
            "submit".into(),
            submission.bundle_path().as_os_str().to_owned(),
            "--farm-id".into(),
            submission.farm_id().into(),
            "--queue-id".into(),
            submission.queue_id().into(),
        ];
        for (key, value) in submission.parameters() {
            args.push("--parameter".into());
            args.push(format!("{key}={value}").into());
        }

        let out = self.output(args).await?;
        if !out.status.success() {
            return Err(ClientError::Submission(stderr_text(&out)));
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        match parse_job_id(&stdout) {
            Some(id) => Ok(JobHandle::new(id)),
            None => Err(ClientError::MissingJobId(truncate_chars(
                stdout.trim(),
                DIAGNOSTIC_CHARS,
            ))),
        }
    }

    async fn get_status(
        &self,
        job: &JobHandle,
        farm_id: &str,
        queue_id: &str,
    ) -> Result<JobStatusSnapshot, ClientError> {
        let out = self
            .output([
                "job",
                "get",
                "--farm-id",
                farm_id,
                "--queue-id",
                queue_id,
                "--job-id",
                job.job_id.as_str(),
            ])
            .await?;
        if !out.status.success() {
            return Err(ClientError::StatusQuery(stderr_text(&out)));
        }
        Ok(parse_status(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn get_logs(&self, job: &JobHandle) -> Result<String, ClientError> {
        let fetch = self.output(["job", "logs", "--job-id", job.job_id.as_str()]);
        let out = tokio::time::timeout(self.log_timeout, fetch)
            .await
            .map_err(|_| ClientError::LogTimeout)??;
        if !out.status.success() {
            return Err(ClientError::LogRetrieval(stderr_text(&out)));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

fn stderr_text(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", out.status)
    } else {
        stderr
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Find the job id in `deadline bundle submit` output.
///
/// A YAML mapping with `jobId` wins; otherwise the first `job-<hex>` token in
/// the raw text is used.
pub(crate) fn parse_job_id(output: &str) -> Option<String> {
    let output = output.trim();
    if output.is_empty() {
        return None;
    }

    let structured = serde_yaml::from_str::<serde_yaml::Value>(output)
        .ok()
        .and_then(|doc| {
            doc.get("jobId")
                .and_then(serde_yaml::Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|id| !id.is_empty());
    if structured.is_some() {
        return structured;
    }

    let found = JOB_ID_RE.find(output)?.as_str().to_string();
    tracing::warn!(job_id = %found, "job ID taken from unstructured submit output");
    Some(found)
}

/// Parse `deadline job get` output. Anything unexpected yields `Unknown`.
pub(crate) fn parse_status(yaml: &str) -> JobStatusSnapshot {
    let doc = serde_yaml::from_str::<serde_yaml::Value>(yaml).unwrap_or(serde_yaml::Value::Null);
    let field = |key: &str| {
        doc.get(key)
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or_default()
    };
    JobStatusSnapshot::new(
        LifecycleStatus::from_wire(field("lifecycleStatus")),
        TaskRunStatus::from_wire(field("taskRunStatus")),
    )
}

// Returns (id, display name) pairs from a YAML list of mappings.
fn parse_listing(
    yaml: &str,
    what: &'static str,
    id_key: &str,
) -> Result<Vec<(String, String)>, ClientError> {
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Option<Vec<serde_yaml::Value>> =
        serde_yaml::from_str(yaml).map_err(|e| ClientError::Malformed {
            what,
            message: e.to_string(),
        })?;

    Ok(entries
        .unwrap_or_default()
        .iter()
        .map(|entry| {
            let id = entry
                .get(id_key)
                .and_then(serde_yaml::Value::as_str)
                .unwrap_or_default()
                .to_string();
            let name = entry
                .get("displayName")
                .and_then(serde_yaml::Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    if id.is_empty() {
                        "Unknown".to_string()
                    } else {
                        id.clone()
                    }
                });
            (id, name)
        })
        .collect())
}
