use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectMode {
    /// Largest absolute sample must stay below the threshold
    Absolute,
    /// Peak-to-peak range must stay below the threshold
    Amplitude,
}

/// Per-epoch artifact rejection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArtifactReject {
    pub mode: RejectMode,
    /// Volts
    pub threshold: f64,
    /// Subtract the epoch mean before testing
    #[serde(default)]
    pub detrend: bool,
}

impl ArtifactReject {
    /// True when the epoch is clean. Any NaN sample rejects the epoch.
    pub fn accepts(&self, samples: &[f64]) -> bool {
        if samples.is_empty() {
            return true;
        }
        if samples.iter().any(|v| v.is_nan()) {
            return false;
        }
        let offset = if self.detrend {
            samples.iter().sum::<f64>() / samples.len() as f64
        } else {
            0.0
        };
        let (lo, hi) = samples
            .iter()
            .map(|v| v - offset)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        let measure = match self.mode {
            RejectMode::Absolute => lo.abs().max(hi.abs()),
            RejectMode::Amplitude => hi - lo,
        };
        measure < self.threshold
    }
}

/// Accepted and rejected epochs for one queue key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochCounts {
    pub valid: usize,
    pub rejected: usize,
}
