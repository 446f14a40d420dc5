//! Digital I/O bit codec
//!
//! The collector reads one byte from a PLC data block and turns it into a
//! step: an ordered vector of booleans, one per configured I/O. Bit `i` of
//! the vector is bit `i` of the byte (LSB first), which is how a Profinet
//! `get_bool(byte, 0, i)` read addresses it.
//!
//! The step is then stored as a *pulse value*: the integer whose binary
//! representation is the vector read MSB first. A 4-I/O step
//! `[false, true, false, true]` has pulse value `0b0101 = 5`.

use serde::{Deserialize, Serialize};

/// One DB byte is read per sample, so at most 8 I/Os fit.
pub const MAX_IOS: usize = 8;

/// Decode a PLC byte into a step vector of `num_bits` entries (LSB first).
pub fn decode_byte(byte: u8, num_bits: usize) -> Vec<bool> {
    (0..num_bits.min(MAX_IOS))
        .map(|i| (byte >> i) & 1 == 1)
        .collect()
}

/// Encode a step vector as its pulse value, first element most significant.
pub fn encode_bits(bits: &[bool]) -> u32 {
    bits.iter().fold(0u32, |acc, &b| (acc << 1) | b as u32)
}

/// Inverse of [`encode_bits`]: `num_bits` entries, MSB first.
pub fn decode_value(value: u32, num_bits: usize) -> Vec<bool> {
    (0..num_bits)
        .rev()
        .map(|shift| shift < 32 && (value >> shift) & 1 == 1)
        .collect()
}

/// Binary string for a step vector (`[true, false, true]` → `"101"`)
pub fn format_bits(bits: &[bool]) -> String {
    bits.iter().map(|&b| if b { '1' } else { '0' }).collect()
}

/// Largest valid pulse value for `num_bits` I/Os.
pub fn max_value(num_bits: usize) -> u32 {
    if num_bits >= 32 {
        u32::MAX
    } else {
        (1u32 << num_bits) - 1
    }
}

/// Input/output counts of a plant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoLayout {
    pub inputs: usize,
    pub outputs: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("plant has no I/Os configured")]
    Empty,
    #[error("number of I/Os ({0}) is greater than 8")]
    TooMany(usize),
}

impl IoLayout {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self { inputs, outputs }
    }

    pub fn total(&self) -> usize {
        self.inputs + self.outputs
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        match self.total() {
            0 => Err(LayoutError::Empty),
            n if n > MAX_IOS => Err(LayoutError::TooMany(n)),
            _ => Ok(()),
        }
    }

    /// Generic names: `in1..inN` followed by `out1..outM`
    pub fn names(&self) -> Vec<String> {
        (1..=self.inputs)
            .map(|i| format!("in{}", i))
            .chain((1..=self.outputs).map(|i| format!("out{}", i)))
            .collect()
    }
}
