use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const NO_REPORT_PLACEHOLDER: &str = "No report generated.";

/// One detected finding. Geometry is center-based, in the natural pixel
/// space of the returned image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f64,
}

/// A file waiting in the queue, or the single in-flight item once dequeued.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl QueueEntry {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// Decoded diagnose payload as handed back by a `DiagnoseClient`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnoseResponse {
    pub converted_image: Option<Vec<u8>>,
    pub annotations: Option<Vec<Annotation>>,
    pub report: Option<String>,
    pub error: Option<String>,
}

impl DiagnoseResponse {
    pub fn has_image(&self) -> bool {
        self.converted_image
            .as_ref()
            .map(|bytes| !bytes.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Processed,
    /// Usable output with a non-fatal note from the service.
    Note,
    Error,
}

impl RecordStatus {
    pub fn label(self) -> &'static str {
        match self {
            RecordStatus::Processed => "Processed",
            RecordStatus::Note => "Note",
            RecordStatus::Error => "Error",
        }
    }
}

/// Permanent outcome of processing one file. Never mutated after it is
/// appended to the result list.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub id: String,
    pub file_name: String,
    pub image: Option<Vec<u8>>,
    /// Shared so the overlay can tell a new list from the one it painted.
    pub annotations: Arc<Vec<Annotation>>,
    pub report: Option<String>,
    pub error: Option<String>,
}

impl ResultRecord {
    pub fn failed(id: String, file_name: String, error: String) -> Self {
        Self {
            id,
            file_name,
            image: None,
            annotations: Arc::new(Vec::new()),
            report: None,
            error: Some(error),
        }
    }

    pub fn status(&self) -> RecordStatus {
        match (&self.report, &self.error) {
            (None, Some(_)) => RecordStatus::Error,
            (Some(_), Some(_)) => RecordStatus::Note,
            _ => RecordStatus::Processed,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status() == RecordStatus::Error
    }
}

/// Aggregate counters derived from queue, in-flight slot and result list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounters {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub total: usize,
}

impl BatchCounters {
    pub fn new(pending: usize, in_flight: bool, completed: usize) -> Self {
        let in_flight = usize::from(in_flight);
        Self {
            pending,
            in_flight,
            completed,
            total: pending + in_flight + completed,
        }
    }
}
