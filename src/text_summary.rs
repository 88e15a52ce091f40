//! Text summary builder for CLI output.
//!
//! Formats extracted software records and farm/queue listings as
//! human-readable lines for text mode.

use crate::model::SoftwareRecord;

const HEADERS: [&str; 4] = ["Name", "Version", "Build Hash", "Channel"];

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build an aligned package table for a completed job.
pub(crate) fn build_text_summary(job_id: &str, records: &[SoftwareRecord]) -> TextSummary {
    let mut lines = vec![format!("Job: {job_id}")];
    if records.is_empty() {
        lines.push("No software packages found".to_string());
        return TextSummary { lines };
    }
    lines.push(format!("Found {} software packages", records.len()));
    lines.push(String::new());

    let rows: Vec<[&str; 4]> = records
        .iter()
        .map(|r| [r.name.as_str(), r.version.as_str(), r.build.as_str(), r.channel.as_str()])
        .collect();
    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    lines.push(format_row(&HEADERS, &widths));
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("  "),
    );
    for row in &rows {
        lines.push(format_row(row, &widths));
    }

    TextSummary { lines }
}

// Last column is left unpadded.
fn format_row(cells: &[&str; 4], widths: &[usize; 4]) -> String {
    format!(
        "{:<w0$}  {:<w1$}  {:<w2$}  {}",
        cells[0],
        cells[1],
        cells[2],
        cells[3],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
    )
}

/// Lines of the form `name (id)` for farm or queue listings.
pub(crate) fn build_listing<'a>(
    what: &str,
    entries: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> TextSummary {
    let lines: Vec<String> = entries
        .into_iter()
        .map(|(id, name)| format!("{name} ({id})"))
        .collect();
    if lines.is_empty() {
        return TextSummary {
            lines: vec![format!("No {what} found")],
        };
    }
    TextSummary { lines }
}
