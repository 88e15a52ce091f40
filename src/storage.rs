//! Export and raw-log files.

use crate::model::SoftwareRecord;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const DEBUG_LOG_FILE_NAME: &str = "deadline_job_output_debug.txt";

/// `~/deadline_job_output_debug.txt`, where raw job output lands for troubleshooting.
pub fn default_debug_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEBUG_LOG_FILE_NAME))
}

pub fn save_raw_log(path: &Path, raw_log: &str) -> Result<()> {
    std::fs::write(path, raw_log).with_context(|| format!("write {}", path.display()))
}

/// Default export file name, e.g. `deadline_software_20251203_214943.csv`.
pub fn default_export_name(extension: &str) -> String {
    let format = time::macros::format_description!("[year][month][day]_[hour][minute][second]");
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let stamp = now.format(&format).unwrap_or_else(|_| "now".into());
    format!("deadline_software_{stamp}.{extension}")
}

/// If `path` is a directory, place a timestamped file inside it.
fn resolve_export_path(path: &Path, extension: &str) -> PathBuf {
    if path.is_dir() {
        path.join(default_export_name(extension))
    } else {
        path.to_path_buf()
    }
}

pub fn export_csv(path: &Path, records: &[SoftwareRecord]) -> Result<PathBuf> {
    let path = resolve_export_path(path, "csv");
    std::fs::write(&path, records_to_csv(records))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

pub fn export_json(path: &Path, records: &[SoftwareRecord]) -> Result<PathBuf> {
    let path = resolve_export_path(path, "json");
    let json = serde_json::to_string_pretty(records)?;
    std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

pub fn records_to_csv(records: &[SoftwareRecord]) -> String {
    let mut out = String::from("Name,Version,Build Hash,Channel\n");
    for r in records {
        out.push_str(&format!(
            "{},{},{},{}\n",
            csv_field(&r.name),
            csv_field(&r.version),
            csv_field(&r.build),
            csv_field(&r.channel)
        ));
    }
    out
}

fn csv_field(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}
