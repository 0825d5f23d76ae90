use crate::calibration::{Calibration, CalibrationHandle};
use crate::core::{SampleBlock, Stage};
use anyhow::{bail, Context, Result};
use evokedlab_macros::StageNode;
use serde_json::Value;

/// RMS over consecutive windows of `duration` seconds.
///
/// Leftover samples carry into the next block; one output sample is produced
/// per complete window at `fs / n`.
#[derive(StageNode, Debug, Clone)]
#[stage_meta(name = "RMS", category = "Level")]
pub struct Rms {
    #[input(name = "In")]
    _input: (),

    #[output(name = "Vrms")]
    _output: (),

    #[param(default = "0.1", min = 0.0)]
    pub duration: f64,

    carry: Vec<Vec<f64>>,
    carry_s0: u64,
}

impl Default for Rms {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl Rms {
    pub fn new(duration: f64) -> Self {
        Self {
            _input: (),
            _output: (),
            duration,
            carry: Vec::new(),
            carry_s0: 0,
        }
    }
}

impl Stage for Rms {
    fn on_create(&mut self, config: Value) -> Result<()> {
        if let Some(duration) = config["duration"].as_f64() {
            self.duration = duration;
        }
        if !(self.duration > 0.0) {
            bail!("RMS window must be positive");
        }
        Ok(())
    }

    fn process(&mut self, block: SampleBlock) -> Result<Vec<SampleBlock>> {
        let n = ((self.duration * block.fs).round() as usize).max(1);
        if self.carry.len() != block.n_channels() || self.carry.iter().all(|c| c.is_empty()) {
            self.carry = vec![Vec::new(); block.n_channels()];
            self.carry_s0 = block.s0;
        }
        for (carry, channel) in self.carry.iter_mut().zip(block.data.iter()) {
            carry.extend_from_slice(channel);
        }

        let windows = self.carry.first().map(|c| c.len()).unwrap_or(0) / n;
        if windows == 0 {
            return Ok(Vec::new());
        }
        let data: Vec<Vec<f64>> = self
            .carry
            .iter_mut()
            .map(|c| {
                let values: Vec<f64> = c
                    .chunks_exact(n)
                    .take(windows)
                    .map(|w| (w.iter().map(|v| v * v).sum::<f64>() / n as f64).sqrt())
                    .collect();
                c.drain(..windows * n);
                values
            })
            .collect();

        let s0 = self.carry_s0 / n as u64;
        self.carry_s0 += (windows * n) as u64;
        Ok(vec![SampleBlock::new(s0, block.fs / n as f64, data)])
    }

    fn reset(&mut self) {
        self.carry.clear();
    }
}

/// Vrms to dB SPL through a calibration at a reference frequency
#[derive(StageNode, Debug, Clone)]
#[stage_meta(name = "SPL", category = "Level")]
pub struct Spl {
    #[input(name = "Vrms")]
    _input: (),

    #[output(name = "dB SPL")]
    _output: (),

    #[param(default = "1000.0", min = 0.0)]
    pub frequency: f64,

    calibration: CalibrationHandle,
}

impl Default for Spl {
    fn default() -> Self {
        Self::new(CalibrationHandle::default(), 1000.0)
    }
}

impl Spl {
    pub fn new(calibration: CalibrationHandle, frequency: f64) -> Self {
        Self {
            _input: (),
            _output: (),
            frequency,
            calibration,
        }
    }
}

impl Stage for Spl {
    fn on_create(&mut self, config: Value) -> Result<()> {
        if let Some(frequency) = config["frequency"].as_f64() {
            self.frequency = frequency;
        }
        if !config["calibration"].is_null() {
            let calibration: Calibration = serde_json::from_value(config["calibration"].clone())
                .context("Invalid SPL calibration")?;
            self.calibration = CalibrationHandle::new(calibration);
        }
        Ok(())
    }

    fn process(&mut self, block: SampleBlock) -> Result<Vec<SampleBlock>> {
        let calibration = self.calibration.get();
        let data = block
            .data
            .iter()
            .map(|c| {
                c.iter()
                    .map(|&v| calibration.get_spl(self.frequency, v))
                    .collect()
            })
            .collect();
        Ok(vec![block.with_data(data)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_windows_carry_remainder() {
        let mut rms = Rms::new(0.01);
        // 10 samples per window at 1 kHz
        let out = rms
            .process(SampleBlock::mono(0, 1000.0, vec![2.0; 15]))
            .unwrap();
        assert_eq!(out[0].channel(0), &[2.0]);
        let out = rms
            .process(SampleBlock::mono(15, 1000.0, vec![2.0; 5]))
            .unwrap();
        assert_eq!(out[0].s0, 1);
        assert!((out[0].fs - 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_spl_uses_calibration() {
        let mut spl = Spl::default();
        spl.on_create(serde_json::json!({
            "frequency": 1000.0,
            "calibration": {"type": "flat", "sensitivity": -94.0, "fixed_gain": 0.0}
        }))
        .unwrap();
        let out = spl
            .process(SampleBlock::mono(0, 10.0, vec![1.0, 0.0]))
            .unwrap()
            .remove(0);
        assert!((out.channel(0)[0] - 94.0).abs() < 1e-9);
        // Zero volts has no level; degrade rather than fail
        assert!(out.channel(0)[1].is_infinite());
    }
}
