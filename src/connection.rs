//! Connectivity and CLI version checks against Deadline Cloud.

use crate::engine::DeadlineCli;
use crate::error::ClientError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

/// Oldest `deadline` CLI known to produce the output formats we parse.
pub const MIN_CLI_VERSION: (u32, u32, u32) = (0, 51, 1);

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// `farm_count` is `None` when the listing answered but could not be parsed.
    Connected { farm_count: Option<usize> },
    Timeout,
    CliNotFound,
    AuthFailed,
    Error(String),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. })
    }

    pub fn message(&self) -> String {
        match self {
            ConnectionStatus::Connected {
                farm_count: Some(n),
            } => format!("Connected ({n} farms)"),
            ConnectionStatus::Connected { farm_count: None } => "Connected".to_string(),
            ConnectionStatus::Timeout => "Connection Timeout".to_string(),
            ConnectionStatus::CliNotFound => "Deadline CLI Not Found".to_string(),
            ConnectionStatus::AuthFailed => "Authentication Failed".to_string(),
            ConnectionStatus::Error(_) => "Connection Error".to_string(),
        }
    }
}

/// List farms under `timeout` and classify the result.
pub async fn check_connection(cli: &DeadlineCli, timeout: Duration) -> ConnectionStatus {
    match tokio::time::timeout(timeout, cli.list_farms()).await {
        Err(_) => ConnectionStatus::Timeout,
        Ok(Ok(farms)) => ConnectionStatus::Connected {
            farm_count: Some(farms.len()),
        },
        Ok(Err(e)) => classify_failure(&e),
    }
}

pub fn classify_failure(err: &ClientError) -> ConnectionStatus {
    match err {
        ClientError::CliNotFound(_) => ConnectionStatus::CliNotFound,
        ClientError::Malformed { .. } => ConnectionStatus::Connected { farm_count: None },
        ClientError::Listing { message, .. } => {
            let lower = message.to_lowercase();
            if lower.contains("credentials") || lower.contains("auth") {
                ConnectionStatus::AuthFailed
            } else {
                ConnectionStatus::Error(message.clone())
            }
        }
        other => ConnectionStatus::Error(other.to_string()),
    }
}

/// Ask the CLI for its version; `Some(warning)` when it is too old.
///
/// Failures to run or parse never block: they yield `None`.
pub async fn check_cli_version(cli: &DeadlineCli) -> Option<String> {
    let output = tokio::time::timeout(Duration::from_secs(5), cli.version())
        .await
        .ok()?
        .ok()?;
    version_warning(&output)
}

pub fn parse_cli_version(output: &str) -> Option<(u32, u32, u32)> {
    let caps = VERSION_RE.captures(output)?;
    Some((
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

pub fn version_warning(output: &str) -> Option<String> {
    let version = parse_cli_version(output)?;
    if version >= MIN_CLI_VERSION {
        return None;
    }
    let (major, minor, patch) = version;
    let (min_major, min_minor, min_patch) = MIN_CLI_VERSION;
    Some(format!(
        "Deadline CLI version {major}.{minor}.{patch} detected. Please upgrade to version \
         {min_major}.{min_minor}.{min_patch} or higher for full compatibility."
    ))
}
