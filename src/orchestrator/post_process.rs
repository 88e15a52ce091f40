//! Post-run processing utilities.
//!
//! Turns a completed run's raw log into software records, keeps the raw log
//! around for troubleshooting, and writes the requested exports.

use crate::cli::Cli;
use crate::extract;
use crate::model::SoftwareRecord;
use crate::storage;
use std::path::{Path, PathBuf};

/// Characters of raw log shown when nothing could be extracted.
const PREVIEW_CHARS: usize = 500;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub records: Vec<SoftwareRecord>,
    /// Human-readable notes about saved files and exports, in order.
    pub messages: Vec<String>,
    pub raw_log_path: Option<PathBuf>,
}

/// Process a completed run: extract records, persist the raw log, export.
///
/// `debug_log_path` receives the raw log whenever no records were found.
pub(crate) fn process_run_completion(
    args: &Cli,
    raw_log: &str,
    debug_log_path: Option<&Path>,
) -> ProcessedRun {
    let records = extract::extract(raw_log);
    tracing::info!(records = records.len(), log_chars = raw_log.chars().count(), "job output parsed");

    let mut messages = Vec::new();
    let mut raw_log_path = None;

    if let Some(path) = args.raw_log.as_deref() {
        match storage::save_raw_log(path, raw_log) {
            Ok(()) => {
                messages.push(format!("Saved raw log: {}", path.display()));
                raw_log_path = Some(path.to_path_buf());
            }
            Err(e) => messages.push(format!("Save raw log failed: {e:#}")),
        }
    }

    if records.is_empty() {
        messages.push("No software packages found in job output".to_string());
        messages.push(format!(
            "Raw output length: {} characters",
            raw_log.chars().count()
        ));
        let preview: String = raw_log.chars().take(PREVIEW_CHARS).collect();
        messages.push(format!("First {PREVIEW_CHARS} characters:\n{preview}"));
        match debug_log_path {
            Some(path) => match storage::save_raw_log(path, raw_log) {
                Ok(()) => {
                    messages.push(format!("Full output saved to: {}", path.display()));
                    raw_log_path.get_or_insert_with(|| path.to_path_buf());
                }
                Err(e) => messages.push(format!("Could not save debug output: {e:#}")),
            },
            None => messages.push("Could not save debug output: no home directory".to_string()),
        }
        return ProcessedRun {
            records,
            messages,
            raw_log_path,
        };
    }

    if let Some(export_path) = args.export_json.as_deref() {
        match storage::export_json(export_path, &records) {
            Ok(p) => messages.push(format!("Exported JSON: {}", p.display())),
            Err(e) => messages.push(format!("Export JSON failed: {e:#}")),
        }
    }
    if let Some(export_path) = args.export_csv.as_deref() {
        match storage::export_csv(export_path, &records) {
            Ok(p) => messages.push(format!("Exported CSV: {}", p.display())),
            Err(e) => messages.push(format!("Export CSV failed: {e:#}")),
        }
    }

    ProcessedRun {
        records,
        messages,
        raw_log_path,
    }
}
