//! remotelab - Remote laboratory management and pulse-train grading
//!
//! Students run an automation exercise on a PLC-driven plant. Every change of
//! the plant's digital I/Os is recorded as a *step*: the I/O state encoded as
//! a decimal pulse value, plus how long it was held. The professor stores a
//! reference sequence for each experiment, and a run is approved when the
//! reference appears complete and in order at least twice in what the
//! student produced.
//!
//! # Overview
//!
//! A 4-I/O plant whose inputs are `[on, off]` and outputs `[off, off]`
//! produces step `[true, false, false, false]`, stored as pulse value `8`
//! (first I/O is the most significant bit).
//!
//! Durations are compared with a relative tolerance (30% by default), so a
//! step held 1.2 s still matches a reference of 1.0 s.
//!
//! # Quick Start
//!
//! ```
//! use remotelab::correction::{correct, CorrectionOptions, PulseStep, Verdict};
//!
//! let pattern = vec![PulseStep::new(8, 1.0), PulseStep::new(4, 2.0)];
//! let collected = vec![
//!     PulseStep::new(8, 1.1),
//!     PulseStep::new(4, 1.9),
//!     PulseStep::new(8, 0.9),
//!     PulseStep::new(4, 2.2),
//!     PulseStep::new(0, 3.0), // discarded: the last reading is incomplete
//! ];
//! let names: Vec<String> = ["in1", "in2", "out1", "out2"].iter().map(|s| s.to_string()).collect();
//!
//! let report = correct(&pattern, &collected, &names, &CorrectionOptions::default()).unwrap();
//! assert_eq!(report.verdict, Verdict::Approved);
//! assert_eq!(report.occurrences, 2);
//! ```
//!
//! # Modules
//!
//! - [`plc`]: bit codec between PLC bytes, step vectors and pulse values
//! - [`recorder`]: turns timed samples into collected rows
//! - [`correction`]: the pattern matcher and its report
//! - [`grading`]: runs the matcher over a stored experiment
//! - [`report`]: text and JSON output
//! - [`db`]: SQLite store (Diesel)
//! - [`csv_io`]: collector CSV import/export
//! - [`secrets`]: AI key encryption and resolution
//! - [`serve`]: REST API
//! - [`config`]: `remotelab.toml` and environment overrides

pub mod config;
pub mod correction;
pub mod csv_io;
pub mod db;
pub mod grading;
pub mod plc;
pub mod recorder;
pub mod report;
pub mod schema;
pub mod secrets;
pub mod serve;

pub use correction::{correct, CorrectionOptions, CorrectionReport, PulseStep, Verdict};
pub use db::{Database, DbError, PlantConfig, PlantConfigInput};
pub use plc::IoLayout;

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // PUBLIC API TESTS
    // ==========================================================================
    //
    // These tests verify the public API surface is correct and documented.
    // ==========================================================================

    #[test]
    fn test_public_exports() {
        let _: Verdict = Verdict::Approved;
        let _ = CorrectionOptions::default();
        let _ = IoLayout::new(4, 4);
    }

    #[test]
    fn test_correct_accessible_from_root() {
        let pattern = vec![PulseStep::value_only(3)];
        let seq = vec![PulseStep::value_only(3), PulseStep::value_only(3), PulseStep::value_only(1)];
        let report: CorrectionReport = correct(&pattern, &seq, &[], &CorrectionOptions::default()).unwrap();
        assert!(report.is_approved());
    }

    #[test]
    fn test_verdict_variants() {
        assert_eq!(Verdict::Approved.to_string(), "APPROVED");
        assert_eq!(Verdict::Rejected.to_string(), "REJECTED");
    }
}
