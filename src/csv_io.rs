//! CSV import and export
//!
//! Collected runs use the collector's column layout so files written here can
//! be fed back in. Ground truth files are two columns: experiment name and the
//! JSON pattern.

use crate::db::{CollectedRow, CollectedSample, GroundTruthRow};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const COL_STEP_INDEX: &str = "Passo";
pub const COL_BITS: &str = "Step";
pub const COL_PULSE_VALUE: &str = "Valor do Passo";
pub const COL_DURATION: &str = "Duracao (s)";
pub const COL_TIMESTAMP: &str = "Timestamp";

const COLLECTED_COLUMNS: [&str; 5] = [
    COL_STEP_INDEX,
    COL_BITS,
    COL_PULSE_VALUE,
    COL_DURATION,
    COL_TIMESTAMP,
];

const GROUND_TRUTH_COLUMNS: [&str; 2] = ["experiment_name", "ground_truth"];

#[derive(Debug, thiserror::Error)]
pub enum CsvError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("row {row}: invalid {column} `{value}`")]
    InvalidValue {
        row: usize,
        column: &'static str,
        value: String,
    },
}

pub type Result<T> = std::result::Result<T, CsvError>;

/// Column positions for `wanted`, or every missing name
fn locate_columns<const N: usize>(headers: &csv::StringRecord, wanted: [&str; N]) -> Result<[usize; N]> {
    let mut found = [0usize; N];
    let mut missing = Vec::new();

    for (slot, name) in found.iter_mut().zip(wanted) {
        match headers.iter().position(|h| h.trim() == name) {
            Some(idx) => *slot = idx,
            None => missing.push(name.to_string()),
        }
    }

    if missing.is_empty() {
        Ok(found)
    } else {
        Err(CsvError::MissingColumns(missing))
    }
}

/// Normalize a bit list cell to JSON. Accepts `[False, True]` and
/// `[false, true]`; anything else is returned as written.
pub fn normalize_bits(cell: &str) -> String {
    let lowered = cell.trim().replace("True", "true").replace("False", "false");
    match serde_json::from_str::<Vec<bool>>(&lowered) {
        Ok(bits) => serde_json::to_string(&bits).unwrap_or(lowered),
        Err(_) => cell.to_string(),
    }
}

fn parse_int(cell: &str, row: usize, column: &'static str) -> Result<Option<i64>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Ok(None);
    }
    if let Ok(v) = cell.parse::<i64>() {
        return Ok(Some(v));
    }
    // pandas writes integer columns with gaps as floats
    match cell.parse::<f64>() {
        Ok(v) if v.fract() == 0.0 && v.is_finite() => Ok(Some(v as i64)),
        _ => Err(CsvError::InvalidValue { row, column, value: cell.to_string() }),
    }
}

fn parse_float(cell: &str, row: usize, column: &'static str) -> Result<Option<f64>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Ok(None);
    }
    cell.parse::<f64>()
        .map(Some)
        .map_err(|_| CsvError::InvalidValue { row, column, value: cell.to_string() })
}

/// Read a collected-run CSV
pub fn read_collected<R: Read>(reader: R) -> Result<Vec<CollectedSample>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let [step_col, bits_col, value_col, duration_col, ts_col] =
        locate_columns(rdr.headers()?, COLLECTED_COLUMNS)?;

    let mut samples = Vec::new();
    for (idx, record) in rdr.records().enumerate() {
        let record = record?;
        // Header is line 1
        let row = idx + 2;
        let cell = |i: usize| record.get(i).unwrap_or("");

        let step = parse_int(cell(step_col), row, COL_STEP_INDEX)?
            .map(|v| {
                i32::try_from(v).map_err(|_| CsvError::InvalidValue {
                    row,
                    column: COL_STEP_INDEX,
                    value: v.to_string(),
                })
            })
            .transpose()?;

        let bits = Some(cell(bits_col).trim())
            .filter(|c| !c.is_empty())
            .map(normalize_bits);

        let time_stamp = Some(cell(ts_col).trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        samples.push(CollectedSample {
            step,
            bits,
            pulse_value: parse_int(cell(value_col), row, COL_PULSE_VALUE)?,
            duration: parse_float(cell(duration_col), row, COL_DURATION)?,
            time_stamp,
        });
    }

    Ok(samples)
}

pub fn read_collected_path(path: &Path) -> Result<Vec<CollectedSample>> {
    read_collected(std::fs::File::open(path)?)
}

/// Read a ground truth CSV, skipping rows with an empty name or pattern
pub fn read_ground_truth<R: Read>(reader: R) -> Result<Vec<GroundTruthRow>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let [name_col, pattern_col] = locate_columns(rdr.headers()?, GROUND_TRUTH_COLUMNS)?;

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let name = record.get(name_col).unwrap_or("").trim();
        let pattern = record.get(pattern_col).unwrap_or("").trim();
        if name.is_empty() || pattern.is_empty() {
            continue;
        }
        rows.push(GroundTruthRow {
            experiment_name: name.to_string(),
            ground_truth: pattern.to_string(),
        });
    }
    Ok(rows)
}

pub fn read_ground_truth_path(path: &Path) -> Result<Vec<GroundTruthRow>> {
    read_ground_truth(std::fs::File::open(path)?)
}

/// Write rows in the collector's layout
pub fn write_collected<W: Write>(writer: W, rows: &[CollectedRow]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(COLLECTED_COLUMNS)?;

    for row in rows {
        wtr.write_record([
            row.step.to_string(),
            row.bits.clone().unwrap_or_default(),
            row.pulse_value.map(|v| v.to_string()).unwrap_or_default(),
            row.duration.map(|v| v.to_string()).unwrap_or_default(),
            row.time_stamp.clone().unwrap_or_default(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Every `*.csv` file under `dir`, sorted by path
pub fn csv_files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}
