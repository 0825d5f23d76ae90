use crate::calibration::chirp::cos2_envelope;
use crate::calibration::{golay_pair, log_chirp, CalibrationHandle, ChirpSettings};
use anyhow::{bail, Result};
use std::f64::consts::{PI, SQRT_2};

/// Lazily rendered stimulus.
///
/// Factories render one whole trial at a time when the queue reaches it, so
/// they see whatever calibration is installed at that moment.
pub trait WaveformFactory: Send {
    /// Trial length in samples at `fs`
    fn n_samples(&self, fs: f64) -> usize;

    fn render(&mut self, fs: f64) -> Result<Vec<f64>>;

    /// Setup-time check, run when the factory is appended
    fn validate(&self, _fs: f64) -> Result<()> {
        Ok(())
    }
}

fn samples(duration: f64, fs: f64) -> usize {
    (duration * fs).round().max(0.0) as usize
}

/// Calibrated sinusoid with cosine-squared onset/offset ramps
#[derive(Debug, Clone)]
pub struct ToneFactory {
    pub frequency: f64,
    /// dB SPL
    pub level: f64,
    /// Seconds
    pub duration: f64,
    /// Seconds
    pub rise_time: f64,
    /// Radians
    pub phase: f64,
    pub calibration: CalibrationHandle,
}

impl ToneFactory {
    pub fn new(
        frequency: f64,
        level: f64,
        duration: f64,
        rise_time: f64,
        calibration: CalibrationHandle,
    ) -> Self {
        Self {
            frequency,
            level,
            duration,
            rise_time,
            phase: 0.0,
            calibration,
        }
    }

    /// Peak amplitude in volts for the configured level
    fn amplitude(&self) -> Result<f64> {
        let sf = self.calibration.get_sf(self.frequency, self.level);
        if !sf.is_finite() {
            bail!(
                "No calibration for {} dB SPL at {} Hz",
                self.level,
                self.frequency
            );
        }
        Ok(sf * SQRT_2)
    }
}

impl WaveformFactory for ToneFactory {
    fn n_samples(&self, fs: f64) -> usize {
        samples(self.duration, fs)
    }

    fn render(&mut self, fs: f64) -> Result<Vec<f64>> {
        let amplitude = self.amplitude()?;
        let n = self.n_samples(fs);
        let ramp_n = samples(self.rise_time, fs).min(n / 2);
        let omega = 2.0 * PI * self.frequency / fs;
        Ok((0..n)
            .map(|i| {
                amplitude * (omega * i as f64 + self.phase).sin() * cos2_envelope(i, n, ramp_n)
            })
            .collect())
    }

    fn validate(&self, fs: f64) -> Result<()> {
        if self.frequency >= fs / 2.0 {
            bail!("Tone at {} Hz is above Nyquist for {} Hz", self.frequency, fs);
        }
        self.amplitude().map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct SilenceFactory {
    pub duration: f64,
}

impl WaveformFactory for SilenceFactory {
    fn n_samples(&self, fs: f64) -> usize {
        samples(self.duration, fs)
    }

    fn render(&mut self, fs: f64) -> Result<Vec<f64>> {
        Ok(vec![0.0; self.n_samples(fs)])
    }
}

#[derive(Debug, Clone)]
pub struct ChirpFactory {
    pub settings: ChirpSettings,
}

impl WaveformFactory for ChirpFactory {
    fn n_samples(&self, fs: f64) -> usize {
        samples(self.settings.duration, fs)
    }

    fn render(&mut self, fs: f64) -> Result<Vec<f64>> {
        Ok(log_chirp(fs, &self.settings))
    }

    fn validate(&self, fs: f64) -> Result<()> {
        let s = &self.settings;
        if !(s.start_frequency > 0.0 && s.end_frequency < fs / 2.0) {
            bail!(
                "Chirp {}-{} Hz does not fit below Nyquist for {} Hz",
                s.start_frequency,
                s.end_frequency,
                fs
            );
        }
        Ok(())
    }
}

/// Which sequence of a complementary pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GolayLeg {
    A,
    B,
}

/// One leg of a Golay pair, scaled to `amplitude` volts
#[derive(Debug, Clone)]
pub struct GolayFactory {
    sequence: Vec<f64>,
}

impl GolayFactory {
    pub fn new(order: u32, leg: GolayLeg, amplitude: f64) -> Self {
        let (a, b) = golay_pair(order);
        let sequence = match leg {
            GolayLeg::A => a,
            GolayLeg::B => b,
        };
        Self {
            sequence: sequence.iter().map(|v| v * amplitude).collect(),
        }
    }

    pub fn sequence(&self) -> &[f64] {
        &self.sequence
    }
}

impl WaveformFactory for GolayFactory {
    fn n_samples(&self, _fs: f64) -> usize {
        self.sequence.len()
    }

    fn render(&mut self, _fs: f64) -> Result<Vec<f64>> {
        Ok(self.sequence.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::spectrum::rms;
    use crate::calibration::Calibration;

    #[test]
    fn test_tone_level_follows_calibration() {
        let handle = CalibrationHandle::new(Calibration::flat(-94.0));
        let mut tone = ToneFactory::new(1000.0, 94.0, 0.1, 0.0, handle.clone());
        let x = tone.render(100000.0).unwrap();
        assert_eq!(x.len(), 10000);
        assert!((rms(&x) - 1.0).abs() < 1e-3);

        // Installed calibrations apply to later renders
        handle.install(Calibration::flat(-100.0));
        let x = tone.render(100000.0).unwrap();
        assert!((rms(&x) - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_uncalibrated_tone_fails_validation() {
        let cal = Calibration::interp(vec![1000.0, 2000.0], vec![-40.0, -42.0]).unwrap();
        let tone = ToneFactory::new(8000.0, 60.0, 0.01, 0.0, CalibrationHandle::new(cal));
        assert!(tone.validate(100000.0).is_err());
    }

    #[test]
    fn test_ramped_tone_edges() {
        let mut tone = ToneFactory::new(1000.0, 0.0, 0.01, 0.002, CalibrationHandle::default());
        let x = tone.render(10000.0).unwrap();
        assert_eq!(x[0], 0.0);
        assert!(x[x.len() - 1].abs() < 1e-12);
    }

    #[test]
    fn test_golay_leg_scaled() {
        let mut g = GolayFactory::new(4, GolayLeg::B, 0.5);
        let x = g.render(1000.0).unwrap();
        assert_eq!(x.len(), 16);
        assert!(x.iter().all(|v| v.abs() == 0.5));
    }
}
