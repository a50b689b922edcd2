//! Text rendering for task progress and conversion output.
//!
//! Pure functions of the state handed to them; the TUI styles the same lines.

use crate::model::{ConversionResult, ProgressSnapshot, TaskSnapshot};

pub(crate) const TABLES_LABEL: &str = "Tables Migrated";
pub(crate) const ROWS_LABEL: &str = "Rows Transferred";
pub(crate) const SPROCS_LABEL: &str = "Stored Procedures";

/// Label/value pairs for a progress snapshot. Absent progress renders as zeros.
pub(crate) fn progress_fields(progress: Option<&ProgressSnapshot>) -> [(&'static str, u64); 3] {
    let p = progress.copied().unwrap_or_default();
    [
        (TABLES_LABEL, p.tables),
        (ROWS_LABEL, p.rows),
        (SPROCS_LABEL, p.sprocs),
    ]
}

pub(crate) fn progress_lines(progress: Option<&ProgressSnapshot>) -> Vec<String> {
    progress_fields(progress)
        .iter()
        .map(|(label, value)| format!("{label}: {value}"))
        .collect()
}

pub(crate) fn status_line(snapshot: &TaskSnapshot) -> String {
    match snapshot.task_id.as_ref() {
        Some(id) => format!("Task {id}: {}", snapshot.status),
        None => format!("Status: {}", snapshot.status),
    }
}

/// Converted SQL followed by one line per warning.
pub(crate) fn conversion_lines(result: Option<&ConversionResult>) -> Vec<String> {
    let Some(result) = result else {
        return Vec::new();
    };
    let mut lines: Vec<String> = result.converted_sql.lines().map(str::to_string).collect();
    lines.extend(result.warnings.iter().map(|w| format!("⚠ {w}")));
    lines
}
