use crate::core::{SampleBlock, Stage};
use anyhow::{bail, Result};
use evokedlab_macros::StageNode;
use serde_json::Value;
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Biquad {
    b: [f64; 3],
    a: [f64; 2],
    x: [f64; 2],
    y: [f64; 2],
}

impl Biquad {
    /// RBJ cookbook section with Butterworth Q
    fn new(f0: f64, fs: f64, highpass: bool) -> Self {
        let q = std::f64::consts::FRAC_1_SQRT_2;
        let omega = 2.0 * PI * f0 / fs;
        let (sin, cos) = omega.sin_cos();
        let alpha = sin / (2.0 * q);
        let a0 = 1.0 + alpha;

        let (b0, b1, b2) = if highpass {
            ((1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0)
        } else {
            ((1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0)
        };

        Self {
            b: [b0 / a0, b1 / a0, b2 / a0],
            a: [-2.0 * cos / a0, (1.0 - alpha) / a0],
            x: [0.0; 2],
            y: [0.0; 2],
        }
    }

    fn step(&mut self, input: f64) -> f64 {
        let output = self.b[0] * input + self.b[1] * self.x[0] + self.b[2] * self.x[1]
            - self.a[0] * self.y[0]
            - self.a[1] * self.y[1];
        self.x = [input, self.x[0]];
        self.y = [output, self.y[0]];
        output
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Band {
    Lowpass(f64),
    Highpass(f64),
    Bandpass(f64, f64),
}

/// Butterworth IIR filter with state carried across blocks, per channel
#[derive(StageNode, Debug, Clone)]
#[stage_meta(name = "IIR Filter", category = "Filters")]
pub struct IirFilter {
    #[input(name = "In")]
    _input: (),

    #[output(name = "Out")]
    _output: (),

    #[param(default = "\"bandpass\"")]
    pub btype: String,

    #[param(default = "300.0", min = 0.0)]
    pub fl: f64,

    #[param(default = "3000.0", min = 0.0)]
    pub fh: f64,

    band: Option<Band>,
    designed_for: Option<f64>,
    sections: Vec<Vec<Biquad>>,
}

impl Default for IirFilter {
    fn default() -> Self {
        Self {
            _input: (),
            _output: (),
            btype: "bandpass".to_string(),
            fl: 300.0,
            fh: 3000.0,
            band: Some(Band::Bandpass(300.0, 3000.0)),
            designed_for: None,
            sections: Vec::new(),
        }
    }
}

impl IirFilter {
    pub fn lowpass(fh: f64) -> Self {
        Self::with_band("lowpass", Band::Lowpass(fh))
    }

    pub fn highpass(fl: f64) -> Self {
        Self::with_band("highpass", Band::Highpass(fl))
    }

    pub fn bandpass(fl: f64, fh: f64) -> Self {
        Self::with_band("bandpass", Band::Bandpass(fl, fh))
    }

    fn with_band(btype: &str, band: Band) -> Self {
        let (fl, fh) = match band {
            Band::Lowpass(fh) => (0.0, fh),
            Band::Highpass(fl) => (fl, 0.0),
            Band::Bandpass(fl, fh) => (fl, fh),
        };
        Self {
            btype: btype.to_string(),
            fl,
            fh,
            band: Some(band),
            ..Default::default()
        }
    }

    fn design(&self, fs: f64) -> Vec<Biquad> {
        match self.band {
            Some(Band::Lowpass(fh)) => vec![Biquad::new(fh, fs, false)],
            Some(Band::Highpass(fl)) => vec![Biquad::new(fl, fs, true)],
            Some(Band::Bandpass(fl, fh)) => {
                vec![Biquad::new(fl, fs, true), Biquad::new(fh, fs, false)]
            }
            None => Vec::new(),
        }
    }

    fn check_nyquist(&self, fs: f64) -> Result<()> {
        let highest = match self.band {
            Some(Band::Lowpass(f)) | Some(Band::Highpass(f)) => f,
            Some(Band::Bandpass(_, f)) => f,
            None => 0.0,
        };
        if highest >= fs / 2.0 {
            bail!("Filter corner {} Hz is above Nyquist for {} Hz", highest, fs);
        }
        Ok(())
    }
}

impl Stage for IirFilter {
    fn on_create(&mut self, config: Value) -> Result<()> {
        if let Some(btype) = config["btype"].as_str() {
            self.btype = btype.to_string();
        }
        if let Some(fl) = config["fl"].as_f64() {
            self.fl = fl;
        }
        if let Some(fh) = config["fh"].as_f64() {
            self.fh = fh;
        }
        self.band = Some(match self.btype.as_str() {
            "lowpass" => Band::Lowpass(self.fh),
            "highpass" => Band::Highpass(self.fl),
            "bandpass" if self.fl < self.fh => Band::Bandpass(self.fl, self.fh),
            "bandpass" => bail!("Bandpass needs fl < fh, got {} and {}", self.fl, self.fh),
            other => bail!("Unknown filter type: {}", other),
        });
        if [self.fl, self.fh].iter().any(|f| !(*f >= 0.0)) {
            bail!("Filter corners must be non-negative");
        }
        self.designed_for = None;
        Ok(())
    }

    fn process(&mut self, block: SampleBlock) -> Result<Vec<SampleBlock>> {
        if self.designed_for != Some(block.fs) {
            self.check_nyquist(block.fs)?;
            let template = self.design(block.fs);
            self.sections = vec![template; block.n_channels()];
            self.designed_for = Some(block.fs);
        }
        if self.sections.len() != block.n_channels() {
            let template = self.design(block.fs);
            self.sections.resize(block.n_channels(), template);
        }

        let data = block
            .data
            .iter()
            .zip(self.sections.iter_mut())
            .map(|(channel, sections)| {
                channel
                    .iter()
                    .map(|&x| sections.iter_mut().fold(x, |v, s| s.step(v)))
                    .collect()
            })
            .collect();
        Ok(vec![block.with_data(data)])
    }

    fn reset(&mut self) {
        self.designed_for = None;
        self.sections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::spectrum::rms;
    use crate::calibration::tone::sine;

    fn run(filter: &mut IirFilter, x: Vec<f64>, chunk: usize) -> Vec<f64> {
        let mut out = Vec::new();
        for (i, part) in x.chunks(chunk).enumerate() {
            let block = SampleBlock::mono((i * chunk) as u64, 10000.0, part.to_vec());
            out.extend_from_slice(filter.process(block).unwrap()[0].channel(0));
        }
        out
    }

    #[test]
    fn test_state_carries_across_blocks() {
        let x = sine(10000.0, 400.0, 1.0, 4000);
        let whole = run(&mut IirFilter::lowpass(1000.0), x.clone(), 4000);
        let chunked = run(&mut IirFilter::lowpass(1000.0), x, 37);
        for (a, b) in whole.iter().zip(chunked.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_lowpass_attenuates_high_tone() {
        let mut f = IirFilter::lowpass(200.0);
        let y = run(&mut f, sine(10000.0, 3000.0, 1.0, 10000), 500);
        assert!(rms(&y[5000..]) < 0.02);
    }

    #[test]
    fn test_config_rejects_inverted_band() {
        let mut f = IirFilter::default();
        let err = f.on_create(serde_json::json!({"btype": "bandpass", "fl": 5000.0, "fh": 100.0}));
        assert!(err.is_err());
    }
}
