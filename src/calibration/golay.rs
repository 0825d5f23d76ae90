//! Golay complementary pair stimuli and deconvolution.
//!
//! For a complementary pair the autocorrelations of A and B sum to a delta of
//! height `2N`, so the system response follows from cross-correlating each
//! recorded response with the sequence that produced it and adding the two.

use super::spectrum::{average_rows, irfft, rfft, rfftfreq, unwrap};
use super::CalibrationError;
use rustfft::num_complex::Complex;

/// Complementary sequences of length `2^order`
pub fn golay_pair(order: u32) -> (Vec<f64>, Vec<f64>) {
    let mut a = vec![1.0, 1.0];
    let mut b = vec![1.0, -1.0];
    for _ in 1..order.max(1) {
        let mut next_a = a.clone();
        next_a.extend(&b);
        let mut next_b = a;
        next_b.extend(b.iter().map(|v| -v));
        a = next_a;
        b = next_b;
    }
    (a, b)
}

/// Transfer function recovered from one Golay pair measurement
#[derive(Debug, Clone)]
pub struct GolayTransfer {
    pub fs: f64,
    pub frequency: Vec<f64>,
    pub spectrum: Vec<Complex<f64>>,
    /// |H(f)|, response Vrms per stimulus Vrms
    pub amplitude: Vec<f64>,
    /// Unwrapped phase of H(f) in radians
    pub phase: Vec<f64>,
    /// Impulse response, one period of the sequence long
    pub impulse: Vec<f64>,
}

impl GolayTransfer {
    pub fn time(&self) -> Vec<f64> {
        (0..self.impulse.len()).map(|i| i as f64 / self.fs).collect()
    }
}

/// Deconvolve averaged responses to A and B.
///
/// `a` and `b` are the sequences exactly as played (including any scaling);
/// responses are truncated to one sequence period.
pub fn golay_tf(
    a: &[f64],
    b: &[f64],
    a_response: &[f64],
    b_response: &[f64],
    fs: f64,
) -> Result<GolayTransfer, CalibrationError> {
    let n = a.len();
    if n == 0 || b.len() != n {
        return Err(CalibrationError::LengthMismatch {
            expected: n,
            actual: b.len(),
        });
    }
    if a_response.len() < n || b_response.len() < n {
        return Err(CalibrationError::LengthMismatch {
            expected: n,
            actual: a_response.len().min(b_response.len()),
        });
    }

    let energy: f64 = a.iter().chain(b.iter()).map(|v| v * v).sum();
    if energy == 0.0 {
        return Err(CalibrationError::EmptyInput);
    }

    let a_psd = rfft(a);
    let b_psd = rfft(b);
    let ah_psd = rfft(&a_response[..n]);
    let bh_psd = rfft(&b_response[..n]);

    let spectrum: Vec<Complex<f64>> = ah_psd
        .iter()
        .zip(a_psd.iter())
        .zip(bh_psd.iter().zip(b_psd.iter()))
        .map(|((ah, a), (bh, b))| (ah * a.conj() + bh * b.conj()) / energy)
        .collect();

    let amplitude = spectrum.iter().map(|c| c.norm()).collect();
    let phase = unwrap(&spectrum.iter().map(|c| c.arg()).collect::<Vec<_>>());
    let impulse = irfft(&spectrum, n);

    Ok(GolayTransfer {
        fs,
        frequency: rfftfreq(n, fs),
        spectrum,
        amplitude,
        phase,
        impulse,
    })
}

/// Drop the leading `discard` repetitions of each sequence, average the
/// remainder and deconvolve.
pub fn summarize_golay(
    fs: f64,
    a: &[f64],
    b: &[f64],
    a_epochs: &[Vec<f64>],
    b_epochs: &[Vec<f64>],
    discard: usize,
) -> Result<GolayTransfer, CalibrationError> {
    let keep_a = a_epochs.get(discard..).unwrap_or(&[]);
    let keep_b = b_epochs.get(discard..).unwrap_or(&[]);
    if keep_a.is_empty() || keep_b.is_empty() {
        return Err(CalibrationError::InsufficientRepetitions {
            available: a_epochs.len().min(b_epochs.len()),
            discard,
        });
    }
    let n = a.len();
    if keep_a.iter().chain(keep_b.iter()).any(|e| e.len() < n) {
        return Err(CalibrationError::LengthMismatch {
            expected: n,
            actual: keep_a
                .iter()
                .chain(keep_b.iter())
                .map(|e| e.len())
                .min()
                .unwrap_or(0),
        });
    }
    let a_mean = average_rows(keep_a, n);
    let b_mean = average_rows(keep_b, n);
    golay_tf(a, b, &a_mean, &b_mean, fs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::spectrum::correlation;

    /// Steady-state response to back-to-back repetitions, i.e. circular convolution
    fn circular(x: &[f64], h: &[f64]) -> Vec<f64> {
        let n = x.len();
        (0..n)
            .map(|i| {
                h.iter()
                    .enumerate()
                    .map(|(k, hk)| hk * x[(i + n - k % n) % n])
                    .sum()
            })
            .collect()
    }

    fn impulse_response(len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| (-(i as f64) / 6.0).exp() * ((i as f64) * 0.9).cos())
            .collect()
    }

    #[test]
    fn test_pair_is_complementary() {
        let (a, b) = golay_pair(6);
        assert_eq!(a.len(), 64);
        for lag in 1..a.len() {
            let ra: f64 = (0..a.len() - lag).map(|i| a[i] * a[i + lag]).sum();
            let rb: f64 = (0..b.len() - lag).map(|i| b[i] * b[i + lag]).sum();
            assert!((ra + rb).abs() < 1e-12, "lag {}", lag);
        }
    }

    #[test]
    fn test_recovers_impulse_response() {
        let (a, b) = golay_pair(9);
        let h = impulse_response(40);
        let ya = circular(&a, &h);
        let yb = circular(&b, &h);

        let tf = golay_tf(&a, &b, &ya, &yb, 48000.0).unwrap();
        let recovered = &tf.impulse[..h.len()];
        assert!(correlation(recovered, &h) > 0.999);
        for (r, e) in recovered.iter().zip(h.iter()) {
            assert!((r - e).abs() < 1e-9);
        }
    }

    #[test]
    fn test_scaled_sequences_keep_unit_transfer() {
        let (a, b) = golay_pair(8);
        let a: Vec<f64> = a.iter().map(|v| v * 0.25).collect();
        let b: Vec<f64> = b.iter().map(|v| v * 0.25).collect();
        let tf = golay_tf(&a, &b, &a, &b, 1000.0).unwrap();
        assert!(tf.amplitude.iter().all(|m| (m - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_discard_drops_onset_repetitions() {
        let (a, b) = golay_pair(7);
        let h = impulse_response(20);
        let transient = vec![5.0; a.len()];
        let a_epochs = vec![transient.clone(), circular(&a, &h), circular(&a, &h)];
        let b_epochs = vec![transient, circular(&b, &h), circular(&b, &h)];

        let tf = summarize_golay(1000.0, &a, &b, &a_epochs, &b_epochs, 1).unwrap();
        assert!(correlation(&tf.impulse[..h.len()], &h) > 0.999);

        let err = summarize_golay(1000.0, &a, &b, &a_epochs, &b_epochs, 3).unwrap_err();
        assert!(matches!(err, CalibrationError::InsufficientRepetitions { .. }));
    }
}
