//! Step recording
//!
//! Turns a stream of timed PLC samples into collected rows. A row is emitted
//! each time the I/O state changes: the state that just ended is closed with
//! its step index and how long it was held. The run ends after
//! `idle_timeout` seconds without any transition, and the open state is
//! closed at that moment.
//!
//! Captured sessions are replayed from sample logs, one `timestamp,byte`
//! per line (the byte as decimal or `0x..` hex; `#` starts a comment).

use crate::plc::{self, IoLayout};
use serde::Serialize;
use std::io::BufRead;

/// Seconds without a transition before a run is considered finished
pub const DEFAULT_IDLE_TIMEOUT: f64 = 30.0;

/// A closed I/O state, ready to be stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedStep {
    pub experiment_id: i32,
    pub experiment_name: String,
    pub step: i32,
    pub bits: Vec<bool>,
    pub pulse_value: u32,
    pub duration: f64,
    /// Unix seconds at which the state was closed
    pub timestamp: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

pub struct StepRecorder {
    experiment_id: i32,
    experiment_name: String,
    num_bits: usize,
    idle_timeout: f64,
    current: Option<Vec<bool>>,
    state_start: f64,
    last_transition: Option<f64>,
    counter: i32,
}

impl StepRecorder {
    pub fn new(experiment_id: i32, experiment_name: &str, layout: IoLayout) -> Self {
        Self {
            experiment_id,
            experiment_name: experiment_name.to_string(),
            num_bits: layout.total().min(plc::MAX_IOS),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            current: None,
            state_start: 0.0,
            last_transition: None,
            counter: 0,
        }
    }

    pub fn with_idle_timeout(mut self, seconds: f64) -> Self {
        self.idle_timeout = seconds;
        self
    }

    /// Number of distinct states seen so far
    pub fn steps_seen(&self) -> i32 {
        self.counter
    }

    /// Feed one sample; returns the previous state if this sample changed it.
    pub fn observe(&mut self, byte: u8, at: f64) -> Option<RecordedStep> {
        let bits = plc::decode_byte(byte, self.num_bits);
        if self.current.as_ref() == Some(&bits) {
            return None;
        }

        let closed = self.current.take().map(|previous| self.close(previous, at));

        self.current = Some(bits);
        self.state_start = at;
        self.last_transition = Some(at);
        self.counter += 1;
        closed
    }

    /// True once no transition has happened for the idle timeout
    pub fn is_idle(&self, now: f64) -> bool {
        self.last_transition
            .map_or(false, |t| now - t > self.idle_timeout)
    }

    /// Close the open state, ending the run
    pub fn finish(&mut self, at: f64) -> Option<RecordedStep> {
        self.current.take().map(|bits| self.close(bits, at))
    }

    fn close(&self, bits: Vec<bool>, at: f64) -> RecordedStep {
        RecordedStep {
            experiment_id: self.experiment_id,
            experiment_name: self.experiment_name.clone(),
            step: self.counter - 1,
            pulse_value: plc::encode_bits(&bits),
            bits,
            duration: (at - self.state_start).max(0.0),
            timestamp: at,
        }
    }

    /// Drive the recorder from a sample log until it ends or the run goes idle.
    pub fn replay<R: BufRead>(&mut self, reader: R) -> Result<Vec<RecordedStep>, ReplayError> {
        let mut steps = Vec::new();
        let mut last_seen = None;

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let (at, byte) = parse_sample(line).map_err(|message| ReplayError::Parse {
                line: idx + 1,
                message,
            })?;

            if self.is_idle(at) {
                let idle_end = self.last_transition.unwrap_or(at) + self.idle_timeout;
                tracing::debug!(at, "run went idle, stopping replay");
                steps.extend(self.finish(idle_end));
                return Ok(steps);
            }

            steps.extend(self.observe(byte, at));
            last_seen = Some(at);
        }

        if let Some(at) = last_seen {
            steps.extend(self.finish(at));
        }
        Ok(steps)
    }
}

fn parse_sample(line: &str) -> Result<(f64, u8), String> {
    let (ts, byte) = line
        .split_once(',')
        .ok_or_else(|| format!("expected `timestamp,byte`, got `{}`", line))?;

    let at: f64 = ts
        .trim()
        .parse()
        .map_err(|_| format!("invalid timestamp `{}`", ts.trim()))?;

    let byte = byte.trim();
    let value = match byte.strip_prefix("0x").or_else(|| byte.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => byte.parse::<u8>(),
    }
    .map_err(|_| format!("invalid byte `{}`", byte))?;

    Ok((at, value))
}

/// Summary string stored after a run: `[v1,v2,...]`
pub fn summary_string(values: &[u32]) -> String {
    let joined: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", joined.join(","))
}
