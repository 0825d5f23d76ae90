use std::sync::Arc;

/// Basic data unit passed between pipeline stages.
///
/// The payload sits behind an `Arc` so fanning a block out to several
/// consumers hands each of them a read-only view instead of a deep copy.
#[derive(Debug, Clone)]
pub struct SampleBlock {
    /// Index of the first sample, counted from the start of acquisition at `fs`
    pub s0: u64,

    /// Sampling rate of this block (changes across a downsampler)
    pub fs: f64,

    /// One row per channel, every row the same length
    pub data: Arc<Vec<Vec<f64>>>,
}

impl SampleBlock {
    pub fn new(s0: u64, fs: f64, data: Vec<Vec<f64>>) -> Self {
        Self {
            s0,
            fs,
            data: Arc::new(data),
        }
    }

    /// Single-channel block
    pub fn mono(s0: u64, fs: f64, samples: Vec<f64>) -> Self {
        Self::new(s0, fs, vec![samples])
    }

    pub fn n_channels(&self) -> usize {
        self.data.len()
    }

    pub fn n_samples(&self) -> usize {
        self.data.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.n_samples() == 0
    }

    /// Index one past the last sample
    pub fn end(&self) -> u64 {
        self.s0 + self.n_samples() as u64
    }

    /// Start time in seconds
    pub fn t0(&self) -> f64 {
        self.s0 as f64 / self.fs
    }

    pub fn channel(&self, index: usize) -> &[f64] {
        self.data.get(index).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// New block with the same timing and a transformed payload
    pub fn with_data(&self, data: Vec<Vec<f64>>) -> Self {
        Self::new(self.s0, self.fs, data)
    }

    /// Same shape, every sample replaced with NaN
    pub fn nan_like(&self) -> Self {
        let data = self
            .data
            .iter()
            .map(|c| vec![f64::NAN; c.len()])
            .collect();
        self.with_data(data)
    }
}
