use crate::model::QueueEntry;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const ACCEPTED_EXTENSIONS: [&str; 2] = ["dcm", "rvg"];
pub const NO_VALID_FILES: &str = "No valid .dcm or .rvg files selected.";

#[derive(Debug, Default)]
pub struct Intake {
    pub accepted: Vec<PathBuf>,
    pub rejected: Vec<PathBuf>,
}

impl Intake {
    /// True when something was offered but nothing survived the filter.
    /// Callers show an advisory and leave the batch engine alone.
    pub fn nothing_accepted(&self) -> bool {
        self.accepted.is_empty() && !self.rejected.is_empty()
    }
}

pub fn is_accepted(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ACCEPTED_EXTENSIONS
                .iter()
                .any(|accepted| ext.eq_ignore_ascii_case(accepted))
        })
        .unwrap_or(false)
}

/// Splits the offered paths by extension, preserving the given order.
pub fn filter_files<I>(paths: I) -> Intake
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut intake = Intake::default();
    for path in paths {
        if is_accepted(&path) {
            intake.accepted.push(path);
        } else {
            intake.rejected.push(path);
        }
    }
    intake
}

pub fn load_entries(paths: &[PathBuf]) -> Result<Vec<QueueEntry>> {
    paths
        .iter()
        .map(|path| {
            let bytes =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            let name = path
                .file_name()
                .and_then(|s| s.to_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| path.display().to_string());
            Ok(QueueEntry::new(name, bytes))
        })
        .collect()
}
