//! Report generation for correction results
//!
//! - **Text**: the grading answer handed back to the student (verdict,
//!   occurrence count, and on rejection a Markdown table plus the per-I/O
//!   explanation of the first wrong step)
//! - **JSON**: the full [`CorrectionReport`] for programmatic consumption
//!
//! ```ignore
//! use remotelab::report;
//!
//! // Picks the format from the extension
//! report::generate("press.json", &report)?; // JSON
//! report::generate("press.txt", &report)?;  // text
//! ```

pub mod json;
pub mod text;

use crate::correction::CorrectionReport;
use serde::Serialize;
use std::io;
use std::path::Path;

pub use text::render_text;

fn wants_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Write a single report in the format matching the file extension
pub fn generate<P: AsRef<Path>>(path: P, report: &CorrectionReport) -> io::Result<()> {
    let path = path.as_ref();
    let mut file = std::fs::File::create(path)?;

    if wants_json(path) {
        json::write(&mut file, report)
    } else {
        text::write(&mut file, report)
    }
}

/// Write a batch of results in the format matching the file extension
pub fn generate_batch<P: AsRef<Path>>(path: P, entries: &[BatchEntry]) -> io::Result<()> {
    let path = path.as_ref();
    let mut file = std::fs::File::create(path)?;

    if wants_json(path) {
        json::write_batch(&mut file, entries)
    } else {
        text::write_batch(&mut file, entries)
    }
}

/// Outcome of correcting one experiment in a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub experiment_id: i32,
    pub experiment_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<CorrectionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary statistics for a batch of results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub approved: usize,
    pub rejected: usize,
    pub error: usize,
}

impl Summary {
    pub fn from_entries(entries: &[BatchEntry]) -> Self {
        let mut summary = Self {
            total: entries.len(),
            ..Self::default()
        };

        for entry in entries {
            match &entry.report {
                Some(r) if r.is_approved() => summary.approved += 1,
                Some(_) => summary.rejected += 1,
                None => summary.error += 1,
            }
        }

        summary
    }
}
