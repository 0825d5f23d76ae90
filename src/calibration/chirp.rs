use super::spectrum::{average_rows, rfft, rfftfreq, unwrap};
use super::CalibrationError;
use std::f64::consts::PI;

/// Logarithmic sweep parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChirpSettings {
    pub start_frequency: f64,
    pub end_frequency: f64,
    /// Seconds
    pub duration: f64,
    /// Peak amplitude in volts
    pub amplitude: f64,
    /// Cosine-squared ramp at each end, seconds
    pub ramp: f64,
}

impl Default for ChirpSettings {
    fn default() -> Self {
        Self {
            start_frequency: 500.0,
            end_frequency: 50000.0,
            duration: 20e-3,
            amplitude: 1.0,
            ramp: 0.0,
        }
    }
}

/// Render a logarithmic sweep at `fs`
pub fn log_chirp(fs: f64, settings: &ChirpSettings) -> Vec<f64> {
    let n = (settings.duration * fs).round() as usize;
    let (f0, f1, t1) = (
        settings.start_frequency,
        settings.end_frequency,
        settings.duration,
    );
    let k = (f1 / f0).ln();
    let ramp_n = ((settings.ramp * fs).round() as usize).min(n / 2);

    (0..n)
        .map(|i| {
            let t = i as f64 / fs;
            let phase = if (f1 - f0).abs() < f64::EPSILON {
                2.0 * PI * f0 * t
            } else {
                2.0 * PI * f0 * t1 / k * ((t / t1 * k).exp() - 1.0)
            };
            settings.amplitude * phase.sin() * cos2_envelope(i, n, ramp_n)
        })
        .collect()
}

/// Cosine-squared onset/offset weight for sample `i` of `n`
pub(crate) fn cos2_envelope(i: usize, n: usize, ramp_n: usize) -> f64 {
    if ramp_n == 0 {
        return 1.0;
    }
    let edge = if i < ramp_n {
        i
    } else if i >= n - ramp_n {
        n - 1 - i
    } else {
        return 1.0;
    };
    let x = edge as f64 / ramp_n as f64 * PI / 2.0;
    x.sin().powi(2)
}

/// Transfer function between a played sweep and its recorded response
#[derive(Debug, Clone)]
pub struct ChirpTransfer {
    pub frequency: Vec<f64>,
    /// |R(f)| / |S(f)|
    pub amplitude: Vec<f64>,
    /// Unwrapped phase of R(f) / S(f) in radians
    pub phase: Vec<f64>,
}

/// Compare response and stimulus spectra bin by bin inside the swept band.
///
/// A single response is used as is; several are averaged first.
pub fn chirp_tf(
    fs: f64,
    stimulus: &[f64],
    responses: &[Vec<f64>],
    band: (f64, f64),
) -> Result<ChirpTransfer, CalibrationError> {
    if stimulus.is_empty() || responses.is_empty() {
        return Err(CalibrationError::EmptyInput);
    }
    let n = responses.iter().map(|r| r.len()).min().unwrap_or(0);
    if n < stimulus.len() {
        return Err(CalibrationError::LengthMismatch {
            expected: stimulus.len(),
            actual: n,
        });
    }

    let response = average_rows(responses, n);
    let mut padded = stimulus.to_vec();
    padded.resize(n, 0.0);

    let s = rfft(&padded);
    let r = rfft(&response);
    let freqs = rfftfreq(n, fs);

    let mut frequency = Vec::new();
    let mut amplitude = Vec::new();
    let mut raw_phase = Vec::new();
    for ((f, s), r) in freqs.iter().zip(s.iter()).zip(r.iter()) {
        if *f < band.0 || *f > band.1 || s.norm() == 0.0 {
            continue;
        }
        let h = r / s;
        frequency.push(*f);
        amplitude.push(h.norm());
        raw_phase.push(h.arg());
    }
    if frequency.is_empty() {
        return Err(CalibrationError::NoValidFrequencies);
    }

    Ok(ChirpTransfer {
        frequency,
        amplitude,
        phase: unwrap(&raw_phase),
    })
}
