//! Pulse-train correction
//!
//! Compares a student's collected sequence against the professor's reference
//! pattern (the "ground truth") and decides whether the experiment was
//! performed correctly.
//!
//! # How Correction Works
//!
//! Every element on both sides is a [`PulseStep`]: the decimal pulse value of
//! the I/O vector plus how long that state was held.
//!
//! 1. **Trim**: the last collected element is discarded. The collector closes
//!    the final state on an idle timeout, so its duration is meaningless.
//!
//! 2. **Noise**: readings with no value, or with a value that cannot be
//!    produced by `n` I/Os (`> 2^n - 1`), are noise. Noise never belongs to an
//!    occurrence and breaks any attempt in progress.
//!
//! 3. **Scan**: the pattern is matched left to right against the sequence.
//!    An occurrence must be complete, contiguous and in order. Occurrences do
//!    not overlap; anything between two occurrences is ignored.
//!
//! 4. **Element match**: values must be equal and the observed duration must
//!    be within the relative tolerance of the expected one (30% by default).
//!    A duration that differs numerically but stays inside the tolerance is
//!    correct.
//!
//! 5. **Verdict**: approved when the pattern occurs at least twice.
//!
//! When the verdict is a rejection, the report keeps the attempt that got
//! furthest through the pattern and explains its first divergent element
//! bit by bit, naming every I/O whose state differed.

use crate::plc::{self, IoLayout};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default relative duration tolerance
pub const DEFAULT_TOLERANCE: f64 = 0.30;

/// Default number of complete occurrences needed for approval
pub const DEFAULT_REQUIRED_OCCURRENCES: usize = 2;

// Float slack so that exactly 30% still counts as inside the tolerance.
const TOLERANCE_EPSILON: f64 = 1e-9;

/// One element of a pulse train: pulse value and how long it was held
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PulseStep {
    pub value: Option<u32>,
    /// Seconds
    pub duration: Option<f64>,
}

impl PulseStep {
    pub fn new(value: u32, duration: f64) -> Self {
        Self { value: Some(value), duration: Some(duration) }
    }

    pub fn value_only(value: u32) -> Self {
        Self { value: Some(value), duration: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectionOptions {
    pub tolerance: f64,
    pub required_occurrences: usize,
    pub drop_last: bool,
}

impl Default for CorrectionOptions {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            required_occurrences: DEFAULT_REQUIRED_OCCURRENCES,
            drop_last: true,
        }
    }
}

impl CorrectionOptions {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_required_occurrences(mut self, required: usize) -> Self {
        self.required_occurrences = required;
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CorrectionError {
    #[error("reference pattern is empty")]
    EmptyPattern,
    #[error("reference pattern element {0} has no pulse value")]
    MissingPatternValue(usize),
    #[error("tolerance must be a non-negative number, got {0}")]
    InvalidTolerance(f64),
    #[error("could not parse pattern: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Verdict::Approved => "APPROVED",
            Verdict::Rejected => "REJECTED",
        })
    }
}

/// Why an attempt stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    Value,
    Time,
    ValueAndTime,
    /// Invalid reading where the next element was expected
    Noise,
    /// Sequence ended before the pattern did
    Missing,
}

/// One pattern element aligned with what the student produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignedRow {
    pub pattern_index: usize,
    /// Index into the evaluated sequence (None when the sequence ran out)
    pub position: Option<usize>,
    pub expected: PulseStep,
    pub observed: Option<PulseStep>,
    pub value_ok: bool,
    pub time_ok: bool,
    /// |observed - expected| / expected, when both durations are known
    pub time_deviation: Option<f64>,
}

impl AlignedRow {
    pub fn is_ok(&self) -> bool {
        self.value_ok && self.time_ok
    }
}

/// Expected vs. observed state of a single I/O
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IoDiff {
    pub name: String,
    pub expected: bool,
    pub observed: bool,
}

impl std::fmt::Display for IoDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} → {}", self.name, on_off(self.expected), on_off(self.observed))
    }
}

fn on_off(state: bool) -> &'static str {
    if state {
        "on"
    } else {
        "off"
    }
}

/// First element where the best attempt failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Divergence {
    pub kind: DivergenceKind,
    pub pattern_index: usize,
    pub position: Option<usize>,
    pub expected: PulseStep,
    pub observed: Option<PulseStep>,
    pub expected_bits: Option<String>,
    pub observed_bits: Option<String>,
    /// Only the I/Os whose state differed
    pub io_diffs: Vec<IoDiff>,
    pub time_deviation: Option<f64>,
}

/// Longest incomplete attempt at matching the pattern
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialMatch {
    /// Sequence index where the attempt started (None for an empty sequence)
    pub start: Option<usize>,
    /// Number of pattern elements matched before the divergence
    pub matched: usize,
    /// Aligned rows up to and including the divergent one
    pub rows: Vec<AlignedRow>,
    pub divergence: Divergence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectionReport {
    pub verdict: Verdict,
    pub occurrences: usize,
    pub occurrence_starts: Vec<usize>,
    pub required_occurrences: usize,
    pub tolerance: f64,
    pub pattern: Vec<PulseStep>,
    /// Length of the sequence after trimming
    pub evaluated_len: usize,
    pub discarded: Option<PulseStep>,
    pub noise_positions: Vec<usize>,
    pub io_names: Vec<String>,
    pub best_partial: Option<PartialMatch>,
}

impl CorrectionReport {
    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approved
    }
}

/// Evaluate `sequence` against the reference `pattern`.
pub fn correct(
    pattern: &[PulseStep],
    sequence: &[PulseStep],
    io_names: &[String],
    options: &CorrectionOptions,
) -> Result<CorrectionReport, CorrectionError> {
    if pattern.is_empty() {
        return Err(CorrectionError::EmptyPattern);
    }
    if let Some(idx) = pattern.iter().position(|p| p.value.is_none()) {
        return Err(CorrectionError::MissingPatternValue(idx));
    }
    if !options.tolerance.is_finite() || options.tolerance < 0.0 {
        return Err(CorrectionError::InvalidTolerance(options.tolerance));
    }

    let (evaluated, discarded) = match sequence.split_last() {
        Some((last, rest)) if options.drop_last => (rest, Some(*last)),
        _ => (sequence, None),
    };

    let matcher = Matcher {
        pattern,
        sequence: evaluated,
        io_names,
        tolerance: options.tolerance,
        ceiling: if io_names.is_empty() { None } else { Some(plc::max_value(io_names.len())) },
    };

    let noise_positions: Vec<usize> =
        (0..evaluated.len()).filter(|&i| matcher.is_noise(i)).collect();

    let mut occurrence_starts = Vec::new();
    let mut best: Option<PartialMatch> = None;
    let mut i = 0;
    while i < evaluated.len() {
        if matcher.is_noise(i) {
            i += 1;
            continue;
        }
        match matcher.attempt(i) {
            Attempt::Complete => {
                occurrence_starts.push(i);
                i += pattern.len();
            }
            Attempt::Partial(partial) => {
                if best.as_ref().map_or(true, |b| partial.matched > b.matched) {
                    best = Some(partial);
                }
                i += 1;
            }
        }
    }

    let occurrences = occurrence_starts.len();
    let verdict = if occurrences >= options.required_occurrences {
        Verdict::Approved
    } else {
        Verdict::Rejected
    };

    let best_partial = match verdict {
        Verdict::Approved => None,
        Verdict::Rejected => Some(best.unwrap_or_else(|| matcher.empty_attempt())),
    };

    Ok(CorrectionReport {
        verdict,
        occurrences,
        occurrence_starts,
        required_occurrences: options.required_occurrences,
        tolerance: options.tolerance,
        pattern: pattern.to_vec(),
        evaluated_len: evaluated.len(),
        discarded,
        noise_positions,
        io_names: io_names.to_vec(),
        best_partial,
    })
}

enum Attempt {
    Complete,
    Partial(PartialMatch),
}

struct Matcher<'a> {
    pattern: &'a [PulseStep],
    sequence: &'a [PulseStep],
    io_names: &'a [String],
    tolerance: f64,
    ceiling: Option<u32>,
}

impl Matcher<'_> {
    fn is_noise(&self, pos: usize) -> bool {
        match self.sequence[pos].value {
            None => true,
            Some(v) => self.ceiling.map_or(false, |max| v > max),
        }
    }

    fn attempt(&self, start: usize) -> Attempt {
        let mut rows = Vec::with_capacity(self.pattern.len());

        for (k, expected) in self.pattern.iter().enumerate() {
            let pos = start + k;

            if pos >= self.sequence.len() {
                rows.push(AlignedRow {
                    pattern_index: k,
                    position: None,
                    expected: *expected,
                    observed: None,
                    value_ok: false,
                    time_ok: false,
                    time_deviation: None,
                });
                let divergence = self.divergence(DivergenceKind::Missing, k, None, *expected, None, None);
                return Attempt::Partial(PartialMatch { start: Some(start), matched: k, rows, divergence });
            }

            let observed = self.sequence[pos];

            if self.is_noise(pos) {
                rows.push(AlignedRow {
                    pattern_index: k,
                    position: Some(pos),
                    expected: *expected,
                    observed: Some(observed),
                    value_ok: false,
                    time_ok: false,
                    time_deviation: None,
                });
                let divergence =
                    self.divergence(DivergenceKind::Noise, k, Some(pos), *expected, Some(observed), None);
                return Attempt::Partial(PartialMatch { start: Some(start), matched: k, rows, divergence });
            }

            let value_ok = observed.value == expected.value;
            let deviation = time_deviation(expected.duration, observed.duration);
            let time_ok = within_tolerance(deviation, self.tolerance);

            rows.push(AlignedRow {
                pattern_index: k,
                position: Some(pos),
                expected: *expected,
                observed: Some(observed),
                value_ok,
                time_ok,
                time_deviation: deviation,
            });

            let kind = match (value_ok, time_ok) {
                (true, true) => continue,
                (false, true) => DivergenceKind::Value,
                (true, false) => DivergenceKind::Time,
                (false, false) => DivergenceKind::ValueAndTime,
            };
            let divergence = self.divergence(kind, k, Some(pos), *expected, Some(observed), deviation);
            return Attempt::Partial(PartialMatch { start: Some(start), matched: k, rows, divergence });
        }

        Attempt::Complete
    }

    /// Rejection with nothing to align (empty or all-noise sequence)
    fn empty_attempt(&self) -> PartialMatch {
        let expected = self.pattern[0];
        PartialMatch {
            start: None,
            matched: 0,
            rows: vec![AlignedRow {
                pattern_index: 0,
                position: None,
                expected,
                observed: None,
                value_ok: false,
                time_ok: false,
                time_deviation: None,
            }],
            divergence: self.divergence(DivergenceKind::Missing, 0, None, expected, None, None),
        }
    }

    fn divergence(
        &self,
        kind: DivergenceKind,
        pattern_index: usize,
        position: Option<usize>,
        expected: PulseStep,
        observed: Option<PulseStep>,
        time_deviation: Option<f64>,
    ) -> Divergence {
        let observed_value = observed.and_then(|o| o.value);
        let width = self.bit_width(expected.value, observed_value);
        let names = self.names(width);

        let expected_bits = expected.value.map(|v| plc::decode_value(v, width));
        let observed_bits = observed_value.map(|v| plc::decode_value(v, width));

        let io_diffs = match (&expected_bits, &observed_bits) {
            (Some(e), Some(o)) => names
                .iter()
                .zip(e.iter().zip(o.iter()))
                .filter(|(_, (a, b))| a != b)
                .map(|(name, (&a, &b))| IoDiff { name: name.clone(), expected: a, observed: b })
                .collect(),
            _ => Vec::new(),
        };

        Divergence {
            kind,
            pattern_index,
            position,
            expected,
            observed,
            expected_bits: expected_bits.as_deref().map(plc::format_bits),
            observed_bits: observed_bits.as_deref().map(plc::format_bits),
            io_diffs,
            time_deviation,
        }
    }

    fn bit_width(&self, expected: Option<u32>, observed: Option<u32>) -> usize {
        if !self.io_names.is_empty() {
            return self.io_names.len();
        }
        let widest = expected.unwrap_or(0).max(observed.unwrap_or(0));
        (32 - widest.leading_zeros() as usize).max(1)
    }

    fn names(&self, width: usize) -> Vec<String> {
        if self.io_names.len() == width {
            self.io_names.to_vec()
        } else {
            (0..width).map(|i| format!("io_{}", i)).collect()
        }
    }
}

/// Relative duration deviation, when both sides are known and expected is positive
pub fn time_deviation(expected: Option<f64>, observed: Option<f64>) -> Option<f64> {
    match (expected, observed) {
        (Some(e), Some(o)) if e > 0.0 && o.is_finite() => Some((o - e).abs() / e),
        _ => None,
    }
}

fn within_tolerance(deviation: Option<f64>, tolerance: f64) -> bool {
    deviation.map_or(true, |d| d <= tolerance + TOLERANCE_EPSILON)
}

// ============================================================================
// Pattern parsing
// ============================================================================

const VALUE_KEYS: &[&str] = &["pulse_value", "pulse_train"];
const DURATION_KEYS: &[&str] = &["duration", "timeToChange", "time_to_change"];
const IO_NAME_KEYS: &[&str] = &["io_names", "io_list", "ios", "IOs"];

/// Parse a stored ground truth into pulse steps.
///
/// Accepted shapes:
/// - `[{"pulse_value": 5, "duration": 1.2}, ...]` (also `pulse_train`,
///   `timeToChange`, `time_to_change`)
/// - `[[5, 1.2], [3, 0.8]]`
/// - `[5, 3, 9]` (the collector summary form)
/// - `{"steps": [...], "io_names": [...]}`
pub fn parse_pattern(raw: &str) -> Result<Vec<PulseStep>, CorrectionError> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| CorrectionError::Parse(e.to_string()))?;
    pattern_from_value(&value)
}

pub fn pattern_from_value(value: &Value) -> Result<Vec<PulseStep>, CorrectionError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("steps").or_else(|| map.get("pattern")) {
            Some(Value::Array(items)) => items,
            _ => return Err(CorrectionError::Parse("object has no `steps` array".to_string())),
        },
        // A JSON string holding the encoded list
        Value::String(inner) => return parse_pattern(inner),
        _ => return Err(CorrectionError::Parse("expected a JSON list".to_string())),
    };

    Ok(items.iter().map(step_from_value).collect())
}

fn step_from_value(item: &Value) -> PulseStep {
    match item {
        Value::Object(map) => PulseStep {
            value: first_present(map, VALUE_KEYS).and_then(as_pulse_value),
            duration: first_present(map, DURATION_KEYS).and_then(as_seconds),
        },
        Value::Array(pair) if pair.len() >= 2 => PulseStep {
            value: as_pulse_value(&pair[0]),
            duration: as_seconds(&pair[1]),
        },
        other => PulseStep { value: as_pulse_value(other), duration: None },
    }
}

/// First key holding a non-null value. A `pulse_value: null` next to a
/// `pulse_train` falls through to the latter instead of yielding no value.
fn first_present<'a>(map: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| map.get(*k)).find(|v| !v.is_null())
}

fn as_pulse_value(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u32>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u32::MAX as f64)
                    .map(|f| f as u32)
            })
        }
        _ => None,
    }
}

fn as_seconds(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

/// Pick I/O names for bit-level explanations.
///
/// Explicitly configured names win, then names embedded in the ground truth
/// (top-level object or the first list item carrying them), then names
/// generated from the plant layout.
pub fn resolve_io_names(
    configured: Option<&[String]>,
    ground_truth: Option<&Value>,
    layout: Option<IoLayout>,
) -> Vec<String> {
    if let Some(names) = configured.filter(|n| !n.is_empty()) {
        return names.to_vec();
    }

    if let Some(gt) = ground_truth {
        let embedded = match gt {
            Value::Object(map) => names_from_object(map),
            Value::Array(items) => items.iter().find_map(|item| match item {
                Value::Object(map) => names_from_object(map),
                _ => None,
            }),
            _ => None,
        };
        if let Some(names) = embedded {
            return names;
        }
    }

    match layout {
        Some(layout) if layout.total() > 0 => layout.names(),
        _ => Vec::new(),
    }
}

fn names_from_object(map: &serde_json::Map<String, Value>) -> Option<Vec<String>> {
    IO_NAME_KEYS.iter().find_map(|k| match map.get(*k) {
        Some(Value::Array(names)) if !names.is_empty() => Some(
            names
                .iter()
                .map(|n| match n {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        _ => None,
    })
}
