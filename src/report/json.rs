//! JSON output

use super::{BatchEntry, Summary};
use crate::correction::CorrectionReport;
use serde::Serialize;
use std::io::{self, Write};

#[derive(Serialize)]
struct BatchReport<'a> {
    generated_at: String,
    summary: Summary,
    results: &'a [BatchEntry],
}

pub fn write<W: Write>(writer: &mut W, report: &CorrectionReport) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, report)?;
    writeln!(writer)
}

pub fn write_batch<W: Write>(writer: &mut W, entries: &[BatchEntry]) -> io::Result<()> {
    let report = BatchReport {
        generated_at: chrono::Local::now().to_rfc3339(),
        summary: Summary::from_entries(entries),
        results: entries,
    };
    serde_json::to_writer_pretty(&mut *writer, &report)?;
    writeln!(writer)
}
