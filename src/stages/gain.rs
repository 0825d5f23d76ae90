use crate::calibration::spectrum::dbi;
use crate::core::{SampleBlock, Stage};
use anyhow::Result;
use evokedlab_macros::StageNode;
use serde_json::Value;

#[derive(StageNode, Debug, Clone)]
#[stage_meta(name = "Gain", category = "Basic")]
pub struct Gain {
    #[input(name = "In")]
    _input: (),

    #[output(name = "Out")]
    _output: (),

    /// Linear factor; `gain_db` in the config takes precedence
    #[param(default = "1.0")]
    pub gain: f64,
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Gain {
    pub fn new(gain: f64) -> Self {
        Self {
            _input: (),
            _output: (),
            gain,
        }
    }
}

impl Stage for Gain {
    fn on_create(&mut self, config: Value) -> Result<()> {
        if let Some(g) = config["gain"].as_f64() {
            self.gain = g;
        }
        if let Some(g) = config["gain_db"].as_f64() {
            self.gain = dbi(g);
        }
        Ok(())
    }

    fn process(&mut self, block: SampleBlock) -> Result<Vec<SampleBlock>> {
        let data = block
            .data
            .iter()
            .map(|c| c.iter().map(|v| v * self.gain).collect())
            .collect();
        Ok(vec![block.with_data(data)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_db_config() {
        let mut gain = Gain::default();
        gain.on_create(serde_json::json!({"gain_db": 20.0})).unwrap();
        let out = gain
            .process(SampleBlock::mono(0, 1.0, vec![0.5]))
            .unwrap()
            .remove(0);
        assert!((out.channel(0)[0] - 5.0).abs() < 1e-12);
    }
}
