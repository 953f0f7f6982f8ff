use crate::model::{BatchCounters, RecordStatus, ResultRecord};
use crate::session::SessionSnapshot;
use serde::Serialize;
use std::sync::Arc;

pub const REPORT_PLACEHOLDER: &str = "Diagnostic report will appear here after analysis.";
pub const ALL_DONE: &str = "All files processed!";

pub fn progress_line(counters: &BatchCounters) -> String {
    format!(
        "Queue: {} pending. Processed: {} / {}.",
        counters.pending, counters.completed, counters.total
    )
}

pub fn is_batch_done(counters: &BatchCounters) -> bool {
    counters.total > 0 && counters.completed == counters.total
}

pub fn history_header(counters: &BatchCounters) -> String {
    let mut header = format!(
        "Processing History ({} / {})",
        counters.completed, counters.total
    );
    if counters.pending > 0 {
        header.push_str(&format!(" - {} pending", counters.pending));
    }
    header
}

pub fn history_lines(results: &[Arc<ResultRecord>], active: Option<usize>) -> Vec<String> {
    results
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let marker = if active == Some(i) { "*" } else { " " };
            format!(
                "{marker} {}. {}: ({})",
                i + 1,
                record.file_name,
                record.status().label()
            )
        })
        .collect()
}

/// Report text for the active record, or the placeholder.
pub fn report_view(active: Option<&ResultRecord>) -> &str {
    active
        .and_then(|r| r.report.as_deref())
        .unwrap_or(REPORT_PLACEHOLDER)
}

/// The active record's own error wins over the transient batch-level one.
pub fn error_banner(snapshot: &SessionSnapshot) -> Option<String> {
    if let Some(active) = snapshot.active() {
        if let Some(error) = &active.error {
            return Some(format!("Error for {}: {error}", active.file_name));
        }
    }
    snapshot.last_error.clone()
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub index: usize,
    pub id: String,
    pub file_name: String,
    pub status: RecordStatus,
    pub error: Option<String>,
    pub annotations: usize,
    pub image_path: Option<String>,
    pub report_path: Option<String>,
}

impl HistoryEntry {
    pub fn from_record(index: usize, record: &ResultRecord) -> Self {
        Self {
            index,
            id: record.id.clone(),
            file_name: record.file_name.clone(),
            status: record.status(),
            error: record.error.clone(),
            annotations: record.annotations.len(),
            image_path: None,
            report_path: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub generated_at: String,
    pub endpoint: String,
    pub counters: BatchCounters,
    pub active_index: Option<usize>,
    pub last_error: Option<String>,
    pub history: Vec<HistoryEntry>,
}
