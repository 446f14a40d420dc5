//! Plain-text grading answer

use super::{BatchEntry, Summary};
use crate::correction::{AlignedRow, CorrectionReport, Divergence, DivergenceKind, PulseStep};
use std::fmt::Write as _;
use std::io::{self, Write};

const OK: &str = "✅";
const WRONG: &str = "❌";

pub const TABLE_HEADER: &str =
    "| Expected pattern up to error | Observed sequence up to error | Incorrect value |";

fn mark(ok: bool) -> &'static str {
    if ok {
        OK
    } else {
        WRONG
    }
}

fn format_duration(duration: Option<f64>) -> String {
    match duration {
        Some(d) => format!("{:.2}s", d),
        None => "?".to_string(),
    }
}

fn format_value(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string())
}

fn format_step(step: &PulseStep) -> String {
    format!("{} / {}", format_value(step.value), format_duration(step.duration))
}

fn table_row(row: &AlignedRow) -> String {
    // The reference side is always correct
    let expected = format!("{} {}", format_step(&row.expected), OK);

    let (observed, incorrect) = match &row.observed {
        None => ("(missing)".to_string(), "missing".to_string()),
        Some(obs) => {
            let cell = format!(
                "{} {}{}",
                format_step(obs),
                mark(row.value_ok),
                mark(row.time_ok)
            );
            let incorrect = match (row.value_ok, row.time_ok) {
                (true, true) => String::new(),
                (false, true) => format_value(obs.value),
                (true, false) => format_duration(obs.duration),
                (false, false) => format_step(obs),
            };
            (cell, incorrect)
        }
    };

    format!("| {} | {} | {} |", expected, observed, incorrect)
}

fn explain(divergence: &Divergence, tolerance: f64, out: &mut String) {
    let step = divergence.pattern_index + 1;

    match divergence.kind {
        DivergenceKind::Missing => {
            let _ = writeln!(
                out,
                "Step {}: expected {} but the sequence ended",
                step,
                format_value(divergence.expected.value)
            );
            return;
        }
        DivergenceKind::Noise => {
            let _ = writeln!(
                out,
                "Step {}: reading {} is not a valid state for this plant (noise)",
                step,
                divergence.observed.map_or_else(|| "?".to_string(), |o| format_value(o.value))
            );
            return;
        }
        _ => {}
    }

    let observed_value = divergence.observed.and_then(|o| o.value);
    let _ = writeln!(
        out,
        "Step {}: expected {} ({}), observed {} ({})",
        step,
        format_value(divergence.expected.value),
        divergence.expected_bits.as_deref().unwrap_or("?"),
        format_value(observed_value),
        divergence.observed_bits.as_deref().unwrap_or("?"),
    );

    for diff in &divergence.io_diffs {
        let _ = writeln!(out, "  {}", diff);
    }

    if matches!(divergence.kind, DivergenceKind::Time | DivergenceKind::ValueAndTime) {
        let _ = writeln!(
            out,
            "Time {}: step {} held {}, expected {} ({:.0}% off, tolerance {:.0}%)",
            WRONG,
            step,
            format_duration(divergence.observed.and_then(|o| o.duration)),
            format_duration(divergence.expected.duration),
            divergence.time_deviation.unwrap_or(0.0) * 100.0,
            tolerance * 100.0,
        );
    }
}

/// Render the grading answer.
///
/// First line `yes`/`no`, a blank line, then the number of complete
/// occurrences. A rejection adds the aligned table and the explanation.
pub fn render_text(report: &CorrectionReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", if report.is_approved() { "yes" } else { "no" });
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", report.occurrences);

    let Some(partial) = report.best_partial.as_ref().filter(|_| !report.is_approved()) else {
        return out;
    };

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", TABLE_HEADER);
    let _ = writeln!(out, "|---|---|---|");
    for row in &partial.rows {
        let _ = writeln!(out, "{}", table_row(row));
    }
    let _ = writeln!(out);
    explain(&partial.divergence, report.tolerance, &mut out);

    out
}

pub fn write<W: Write>(writer: &mut W, report: &CorrectionReport) -> io::Result<()> {
    writer.write_all(render_text(report).as_bytes())
}

pub fn write_batch<W: Write>(writer: &mut W, entries: &[BatchEntry]) -> io::Result<()> {
    for entry in entries {
        match (&entry.report, &entry.error) {
            (Some(report), _) => writeln!(
                writer,
                "{:<6} {:<9} {:>3}/{}  {}",
                entry.experiment_id,
                report.verdict,
                report.occurrences,
                report.required_occurrences,
                entry.experiment_name
            )?,
            (None, error) => writeln!(
                writer,
                "{:<6} {:<9} {:>5}  {} ({})",
                entry.experiment_id,
                "ERROR",
                "-",
                entry.experiment_name,
                error.as_deref().unwrap_or("unknown error")
            )?,
        }
    }

    let summary = Summary::from_entries(entries);
    writeln!(writer)?;
    writeln!(
        writer,
        "{} experiments: {} approved, {} rejected, {} errors",
        summary.total, summary.approved, summary.rejected, summary.error
    )
}
