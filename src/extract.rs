//! Software record extraction from job log text.
//!
//! Job logs interleave conda package listing lines with worker/session noise,
//! and the timestamp prefix differs between execution environments:
//!
//! ```text
//! [2025-12-03T21:49:43.773000+00:00] blender 3.6.23 481731fa..._0 deadline-cloud
//! 2025/12/06 11:27:34-08:00 blender 4.5.0 hb0f4dca_0 Conda/Default
//! ```
//!
//! Lines are handled independently. Known noise is dropped through
//! [`NOISE_DENYLIST`], the rest is matched against a single shape-checked pattern.

use crate::model::SoftwareRecord;
use once_cell::sync::Lazy;
use regex::Regex;

/// Lowercase substrings marking diagnostic lines that are never packages.
/// Checked in order against the lowercased line.
pub const NOISE_DENYLIST: &[&str] = &[
    "process pid",
    "exited with code",
    "retrieving logs",
    "retrieved ",
    "uploading output",
    "job attachments",
    "session session",
    "worker 0 of 0",
    "messages (0 of 0)",
];

// Optional timestamp, then name, dotted version, build, channel.
static RECORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:(?:\[[\dT:+.-]+\]|\d{4}/\d{2}/\d{2}\s+[\d:-]+)\s+)?(\S+)\s+([\d.]+)\s+(\S+)\s+(\S+)",
    )
    .unwrap()
});

static PACKAGE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Extract software records from raw log text, in order of appearance.
///
/// Never fails; unrecognised lines are skipped.
pub fn extract(text: &str) -> Vec<SoftwareRecord> {
    text.lines().filter_map(extract_line).collect()
}

/// Extract a record from a single line, if it is a package line.
pub fn extract_line(line: &str) -> Option<SoftwareRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    if is_table_header(line) || is_noise(line) || is_separator(trimmed) {
        return None;
    }

    let caps = RECORD_RE.captures(line)?;
    let name = &caps[1];
    if !PACKAGE_NAME_RE.is_match(name) {
        return None;
    }
    Some(SoftwareRecord {
        name: name.to_string(),
        version: caps[2].to_string(),
        build: caps[3].to_string(),
        channel: caps[4].to_string(),
    })
}

// Conda's `# Name  Version  Build  Channel` header, with or without the hash.
fn is_table_header(line: &str) -> bool {
    line.contains("Name") && line.contains("Version") && line.contains("Build")
}

fn is_noise(line: &str) -> bool {
    let lower = line.to_lowercase();
    NOISE_DENYLIST.iter().any(|needle| lower.contains(needle))
}

fn is_separator(trimmed: &str) -> bool {
    trimmed.starts_with('-') && trimmed.chars().all(|c| c == '-' || c.is_whitespace())
}
