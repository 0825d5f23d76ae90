use crate::core::{SampleBlock, Stage};
use anyhow::{bail, Result};
use evokedlab_macros::StageNode;
use serde_json::Value;

pub type TransformFn = Box<dyn FnMut(f64) -> f64 + Send>;

/// Per-sample mapping, e.g. a sensor's volts to physical units.
///
/// Inputs outside `[lower, upper]` become NaN instead of being mapped, so an
/// excursion degrades the affected samples and nothing else.
#[derive(StageNode)]
#[stage_meta(name = "Transform", category = "Basic")]
pub struct Transform {
    #[input(name = "In")]
    _input: (),

    #[output(name = "Out")]
    _output: (),

    /// `identity`, `abs`, `square`, `sqrt`, `db` or `linear`
    #[param(default = "\"identity\"")]
    pub op: String,

    #[param(default = "1.0")]
    pub scale: f64,

    #[param(default = "0.0")]
    pub offset: f64,

    pub lower: Option<f64>,
    pub upper: Option<f64>,

    function: TransformFn,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            op: "identity".to_string(),
            ..Self::new(|v| v)
        }
    }
}

impl Transform {
    pub fn new(function: impl FnMut(f64) -> f64 + Send + 'static) -> Self {
        Self {
            _input: (),
            _output: (),
            op: "custom".to_string(),
            scale: 1.0,
            offset: 0.0,
            lower: None,
            upper: None,
            function: Box::new(function),
        }
    }

    pub fn with_range(mut self, lower: f64, upper: f64) -> Self {
        self.lower = Some(lower);
        self.upper = Some(upper);
        self
    }

    fn in_range(&self, v: f64) -> bool {
        self.lower.map(|l| v >= l).unwrap_or(true) && self.upper.map(|u| v <= u).unwrap_or(true)
    }
}

impl Stage for Transform {
    fn on_create(&mut self, config: Value) -> Result<()> {
        if let Some(op) = config["op"].as_str() {
            self.op = op.to_string();
        }
        if let Some(scale) = config["scale"].as_f64() {
            self.scale = scale;
        }
        if let Some(offset) = config["offset"].as_f64() {
            self.offset = offset;
        }
        self.lower = config["lower"].as_f64().or(self.lower);
        self.upper = config["upper"].as_f64().or(self.upper);

        let (scale, offset) = (self.scale, self.offset);
        self.function = match self.op.as_str() {
            "identity" => Box::new(|v| v),
            "abs" => Box::new(f64::abs),
            "square" => Box::new(|v| v * v),
            "sqrt" => Box::new(f64::sqrt),
            "db" => Box::new(|v: f64| 20.0 * v.log10()),
            "linear" => Box::new(move |v| v * scale + offset),
            other => bail!("Unknown transform op: {}", other),
        };
        Ok(())
    }

    fn process(&mut self, block: SampleBlock) -> Result<Vec<SampleBlock>> {
        let mut data = Vec::with_capacity(block.n_channels());
        for channel in block.data.iter() {
            let mut mapped = Vec::with_capacity(channel.len());
            for &v in channel {
                mapped.push(if self.in_range(v) {
                    (self.function)(v)
                } else {
                    f64::NAN
                });
            }
            data.push(mapped);
        }
        Ok(vec![block.with_data(data)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_becomes_nan() {
        let mut t = Transform::new(|v| v * 100.0).with_range(0.0, 5.0);
        let out = t
            .process(SampleBlock::mono(0, 1.0, vec![1.0, 6.0, -1.0, 5.0]))
            .unwrap()
            .remove(0);
        let c = out.channel(0);
        assert_eq!(c[0], 100.0);
        assert!(c[1].is_nan() && c[2].is_nan());
        assert_eq!(c[3], 500.0);
    }

    #[test]
    fn test_linear_from_config() {
        let mut t = Transform::default();
        t.on_create(serde_json::json!({"op": "linear", "scale": 2.0, "offset": 1.0}))
            .unwrap();
        let out = t.process(SampleBlock::mono(0, 1.0, vec![3.0])).unwrap();
        assert_eq!(out[0].channel(0), &[7.0]);
    }
}
