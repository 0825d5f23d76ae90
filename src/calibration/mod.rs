//! Calibration: the frequency dependent relation between volts and SPL, and
//! the tone, Golay and chirp measurements that produce it.

pub mod chirp;
pub mod golay;
pub mod procedure;
pub mod result;
pub mod spectrum;
pub mod tone;
pub mod types;

pub use chirp::{chirp_tf, log_chirp, ChirpSettings, ChirpTransfer};
pub use golay::{golay_pair, golay_tf, summarize_golay, GolayTransfer};
pub use result::{save_merged, CalibrationResult, Diagnostic, SafetyLimit};
pub use tone::{tone_sens, ToneAnalysis, ToneMeasurement, ToneSettings};
pub use types::{Calibration, CalibrationHandle};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("expected {expected} values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("no valid frequencies remain")]
    NoValidFrequencies,

    #[error("calibration frequencies must be positive and finite")]
    InvalidFrequency,

    #[error("empty input")]
    EmptyInput,

    #[error("only {available} repetitions acquired, {discard} to discard")]
    InsufficientRepetitions { available: usize, discard: usize },
}
