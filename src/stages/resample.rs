use crate::core::{SampleBlock, Stage};
use anyhow::{bail, Result};
use evokedlab_macros::StageNode;
use serde_json::Value;

/// Keeps every `q`-th sample.
///
/// Samples are picked by absolute index (`s0 + i` divisible by `q`), so the
/// decimation phase survives arbitrary block boundaries and output sample
/// `k` always sits at input sample `k * q`.
#[derive(StageNode, Debug, Clone)]
#[stage_meta(name = "Downsample", category = "Resampling")]
pub struct Downsample {
    #[input(name = "In")]
    _input: (),

    #[output(name = "Out")]
    _output: (),

    #[param(default = "2", min = 1.0)]
    pub q: usize,
}

impl Default for Downsample {
    fn default() -> Self {
        Self::new(2)
    }
}

impl Downsample {
    pub fn new(q: usize) -> Self {
        Self {
            _input: (),
            _output: (),
            q,
        }
    }
}

impl Stage for Downsample {
    fn on_create(&mut self, config: Value) -> Result<()> {
        if let Some(q) = config["q"].as_u64() {
            self.q = q as usize;
        }
        if self.q == 0 {
            bail!("Downsample factor must be at least 1");
        }
        Ok(())
    }

    fn process(&mut self, block: SampleBlock) -> Result<Vec<SampleBlock>> {
        let q = self.q as u64;
        let first = block.s0.div_ceil(q) * q;
        let skip = (first - block.s0) as usize;
        let data = block
            .data
            .iter()
            .map(|c| c.iter().skip(skip).step_by(self.q).copied().collect())
            .collect();
        Ok(vec![SampleBlock::new(first / q, block.fs / q as f64, data)])
    }
}

/// Re-chunks the stream into blocks of exactly `size` samples
#[derive(StageNode, Debug, Clone)]
#[stage_meta(name = "Blocked", category = "Resampling")]
pub struct Blocked {
    #[input(name = "In")]
    _input: (),

    #[output(name = "Out")]
    _output: (),

    #[param(default = "1024", min = 1.0)]
    pub size: usize,

    carry: Vec<Vec<f64>>,
    carry_s0: u64,
}

impl Default for Blocked {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Blocked {
    pub fn new(size: usize) -> Self {
        Self {
            _input: (),
            _output: (),
            size,
            carry: Vec::new(),
            carry_s0: 0,
        }
    }
}

impl Stage for Blocked {
    fn on_create(&mut self, config: Value) -> Result<()> {
        if let Some(size) = config["size"].as_u64() {
            self.size = size as usize;
        }
        if self.size == 0 {
            bail!("Block size must be at least 1");
        }
        Ok(())
    }

    fn process(&mut self, block: SampleBlock) -> Result<Vec<SampleBlock>> {
        if self.carry.len() != block.n_channels() || self.carry.iter().all(|c| c.is_empty()) {
            self.carry = vec![Vec::new(); block.n_channels()];
            self.carry_s0 = block.s0;
        }
        for (carry, channel) in self.carry.iter_mut().zip(block.data.iter()) {
            carry.extend_from_slice(channel);
        }

        let mut out = Vec::new();
        while self.carry.first().map(|c| c.len()).unwrap_or(0) >= self.size {
            let data: Vec<Vec<f64>> = self
                .carry
                .iter_mut()
                .map(|c| c.drain(..self.size).collect())
                .collect();
            out.push(SampleBlock::new(self.carry_s0, block.fs, data));
            self.carry_s0 += self.size as u64;
        }
        Ok(out)
    }

    fn reset(&mut self) {
        self.carry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(s0: u64, n: usize) -> SampleBlock {
        SampleBlock::mono(s0, 100.0, (s0..s0 + n as u64).map(|v| v as f64).collect())
    }

    #[test]
    fn test_downsample_phase_across_blocks() {
        let mut ds = Downsample::new(3);
        let a = ds.process(ramp(0, 7)).unwrap().remove(0);
        let b = ds.process(ramp(7, 7)).unwrap().remove(0);
        assert_eq!(a.channel(0), &[0.0, 3.0, 6.0]);
        assert_eq!(b.s0, 3);
        assert_eq!(b.channel(0), &[9.0, 12.0]);
        assert!((b.fs - 100.0 / 3.0).abs() < 1e-12);
        // Alignment: output k sits at input k * q
        assert!((b.t0() - 9.0 / 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_blocked_rechunks() {
        let mut bl = Blocked::new(4);
        assert!(bl.process(ramp(0, 3)).unwrap().is_empty());
        let out = bl.process(ramp(3, 6)).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].channel(0), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(out[1].s0, 4);
        let out = bl.process(ramp(9, 3)).unwrap();
        assert_eq!(out[0].channel(0), &[8.0, 9.0, 10.0, 11.0]);
    }
}
