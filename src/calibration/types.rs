use super::spectrum::{db, dbi};
use super::CalibrationError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Relative tolerance when matching a frequency against point calibrations
const POINT_TOLERANCE: f64 = 1e-6;

/// Maps (frequency, level) to (gain, attenuation, SPL) for one channel.
///
/// Sensitivity is the level in dB re 1 Vrms that corresponds to 0 dB SPL at a
/// given frequency, with any fixed hardware gain already removed. The same
/// convention serves outputs (volts needed for a level) and inputs (level
/// represented by a measured voltage).
///
/// Queries outside the measured range return `NaN` for every variant and
/// every method; callers that drive hardware must check `is_finite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Calibration {
    /// Frequency independent sensitivity, used before anything is measured
    Flat { sensitivity: f64, fixed_gain: f64 },

    /// Exact lookup at the measured frequencies only
    Point {
        frequency: Vec<f64>,
        sensitivity: Vec<f64>,
        fixed_gain: f64,
    },

    /// Linear interpolation in log-frequency between measured points
    Interp {
        frequency: Vec<f64>,
        sensitivity: Vec<f64>,
        phase: Option<Vec<f64>>,
        fixed_gain: f64,
    },
}

impl Default for Calibration {
    fn default() -> Self {
        Self::unity()
    }
}

impl Calibration {
    /// 1 Vrms reads as 0 dB
    pub fn unity() -> Self {
        Calibration::Flat {
            sensitivity: 0.0,
            fixed_gain: 0.0,
        }
    }

    pub fn flat(sensitivity: f64) -> Self {
        Calibration::Flat {
            sensitivity,
            fixed_gain: 0.0,
        }
    }

    /// Microphone style calibration from a sensitivity in V/Pa
    pub fn from_mv_pa(mv_pa: f64) -> Self {
        // 0 dB SPL is 20 µPa
        Calibration::flat(db(mv_pa * 1e-3 * 20e-6))
    }

    pub fn point(frequency: Vec<f64>, sensitivity: Vec<f64>) -> Result<Self, CalibrationError> {
        let (frequency, sensitivity, _) = sorted_points(frequency, sensitivity, None)?;
        Ok(Calibration::Point {
            frequency,
            sensitivity,
            fixed_gain: 0.0,
        })
    }

    pub fn interp(frequency: Vec<f64>, sensitivity: Vec<f64>) -> Result<Self, CalibrationError> {
        Self::interp_with_phase(frequency, sensitivity, None)
    }

    pub fn interp_with_phase(
        frequency: Vec<f64>,
        sensitivity: Vec<f64>,
        phase: Option<Vec<f64>>,
    ) -> Result<Self, CalibrationError> {
        let (frequency, sensitivity, phase) = sorted_points(frequency, sensitivity, phase)?;
        Ok(Calibration::Interp {
            frequency,
            sensitivity,
            phase,
            fixed_gain: 0.0,
        })
    }

    pub fn with_fixed_gain(mut self, gain: f64) -> Self {
        match &mut self {
            Calibration::Flat { fixed_gain, .. }
            | Calibration::Point { fixed_gain, .. }
            | Calibration::Interp { fixed_gain, .. } => *fixed_gain = gain,
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            Calibration::Flat { .. } => "flat",
            Calibration::Point { .. } => "point",
            Calibration::Interp { .. } => "interp",
        }
    }

    /// Measured frequency range, `None` for flat calibrations
    pub fn frequency_range(&self) -> Option<(f64, f64)> {
        match self {
            Calibration::Flat { .. } => None,
            Calibration::Point { frequency, .. } | Calibration::Interp { frequency, .. } => {
                Some((*frequency.first()?, *frequency.last()?))
            }
        }
    }

    /// Sensitivity in dB re 1 Vrms for 0 dB SPL
    pub fn get_sens(&self, frequency: f64) -> f64 {
        match self {
            Calibration::Flat {
                sensitivity,
                fixed_gain,
            } => sensitivity - fixed_gain,
            Calibration::Point {
                frequency: freqs,
                sensitivity,
                fixed_gain,
            } => freqs
                .iter()
                .position(|f| (f - frequency).abs() <= POINT_TOLERANCE * f.abs().max(1.0))
                .map(|i| sensitivity[i] - fixed_gain)
                .unwrap_or(f64::NAN),
            Calibration::Interp {
                frequency: freqs,
                sensitivity,
                fixed_gain,
                ..
            } => interp_log(freqs, sensitivity, frequency) - fixed_gain,
        }
    }

    /// Unwrapped phase correction in radians (0 when no phase was measured)
    pub fn get_phase(&self, frequency: f64) -> f64 {
        match self {
            Calibration::Interp {
                frequency: freqs,
                phase: Some(phase),
                ..
            } => interp_log(freqs, phase, frequency),
            _ if self.get_sens(frequency).is_nan() => f64::NAN,
            _ => 0.0,
        }
    }

    /// Scale factor (Vrms) needed to reach `spl` dB SPL
    pub fn get_sf(&self, frequency: f64, spl: f64) -> f64 {
        dbi(self.get_gain(frequency, spl))
    }

    /// Gain in dB re 1 Vrms needed to reach `spl` dB SPL
    pub fn get_gain(&self, frequency: f64, spl: f64) -> f64 {
        spl + self.get_sens(frequency)
    }

    /// Level in dB SPL produced by (or represented by) `vrms`
    pub fn get_spl(&self, frequency: f64, vrms: f64) -> f64 {
        db(vrms) - self.get_sens(frequency)
    }

    /// Calibrated dB SPL of one amplitude spectrum bin (Vrms)
    pub fn get_db(&self, frequency: f64, psd: f64) -> f64 {
        self.get_spl(frequency, psd)
    }

    /// Calibrated dB SPL for a whole amplitude spectrum
    pub fn get_db_spectrum(&self, frequency: &[f64], psd: &[f64]) -> Vec<f64> {
        frequency
            .iter()
            .zip(psd.iter())
            .map(|(&f, &p)| self.get_db(f, p))
            .collect()
    }

    /// Attenuation in dB needed to bring `vrms` down to `level` dB SPL
    pub fn get_attenuation(&self, frequency: f64, vrms: f64, level: f64) -> f64 {
        self.get_spl(frequency, vrms) - level
    }

    /// Mean scale factor across `[flb, fub]`, sampled on a log grid
    pub fn get_mean_sf(&self, flb: f64, fub: f64, spl: f64) -> f64 {
        const POINTS: usize = 256;
        if !(flb > 0.0 && fub >= flb) {
            return f64::NAN;
        }
        let (llb, lub) = (flb.log10(), fub.log10());
        let sum: f64 = (0..POINTS)
            .map(|i| {
                let f = 10f64.powf(llb + (lub - llb) * i as f64 / (POINTS - 1) as f64);
                self.get_sf(f, spl)
            })
            .sum();
        sum / POINTS as f64
    }
}

fn sorted_points(
    frequency: Vec<f64>,
    sensitivity: Vec<f64>,
    phase: Option<Vec<f64>>,
) -> Result<(Vec<f64>, Vec<f64>, Option<Vec<f64>>), CalibrationError> {
    if frequency.len() != sensitivity.len()
        || phase.as_ref().map(|p| p.len() != frequency.len()).unwrap_or(false)
    {
        return Err(CalibrationError::LengthMismatch {
            expected: frequency.len(),
            actual: sensitivity.len(),
        });
    }
    if frequency.is_empty() {
        return Err(CalibrationError::NoValidFrequencies);
    }
    if frequency.iter().any(|f| !(*f > 0.0) || !f.is_finite()) {
        return Err(CalibrationError::InvalidFrequency);
    }

    let mut order: Vec<usize> = (0..frequency.len()).collect();
    order.sort_by(|&a, &b| frequency[a].total_cmp(&frequency[b]));
    let f = order.iter().map(|&i| frequency[i]).collect();
    let s = order.iter().map(|&i| sensitivity[i]).collect();
    let p = phase.map(|p| order.iter().map(|&i| p[i]).collect());
    Ok((f, s, p))
}

/// Linear interpolation over log10(frequency); NaN outside `[first, last]`
fn interp_log(freqs: &[f64], values: &[f64], frequency: f64) -> f64 {
    let (first, last) = match (freqs.first(), freqs.last()) {
        (Some(f), Some(l)) => (*f, *l),
        _ => return f64::NAN,
    };
    if !(frequency >= first && frequency <= last) {
        return f64::NAN;
    }
    let upper = freqs.partition_point(|f| *f < frequency);
    if freqs[upper] == frequency || upper == 0 {
        return values[upper];
    }
    let lower = upper - 1;
    let x0 = freqs[lower].log10();
    let x1 = freqs[upper].log10();
    let t = (frequency.log10() - x0) / (x1 - x0);
    values[lower] + t * (values[upper] - values[lower])
}

/// Shared, swappable calibration attached to a channel.
///
/// Waveform factories hold a clone and read it at render time, so installing
/// a new calibration affects every later trial on that channel.
#[derive(Debug, Clone, Default)]
pub struct CalibrationHandle {
    inner: Arc<RwLock<Calibration>>,
}

impl CalibrationHandle {
    pub fn new(calibration: Calibration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(calibration)),
        }
    }

    /// Snapshot of the installed calibration
    pub fn get(&self) -> Calibration {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn install(&self, calibration: Calibration) {
        tracing::info!(kind = calibration.name(), "installing calibration");
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = calibration;
    }

    pub fn get_sf(&self, frequency: f64, spl: f64) -> f64 {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_sf(frequency, spl)
    }

    pub fn get_spl(&self, frequency: f64, vrms: f64) -> f64 {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_spl(frequency, vrms)
    }
}
