use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Free-form tags describing the stimulus setting behind a trial
pub type Metadata = BTreeMap<String, Value>;

/// An expected future epoch, in the sample domain of the extracting input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRequest {
    /// First sample of the window
    pub start: u64,

    /// Window length in samples
    pub duration: usize,

    /// Silence following the stimulus, in samples
    pub delay: usize,

    /// Queue entry that produced the trial, if any
    pub key: Option<u64>,

    pub metadata: Metadata,
}

impl EpochRequest {
    pub fn new(start: u64, duration: usize, metadata: Metadata) -> Self {
        Self {
            start,
            duration,
            delay: 0,
            key: None,
            metadata,
        }
    }

    /// Index one past the last sample of the window
    pub fn end(&self) -> u64 {
        self.start + self.duration as u64
    }
}

/// A finite, metadata-tagged slice of one channel's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    pub start: u64,
    pub fs: f64,
    pub key: Option<u64>,
    pub metadata: Metadata,
    pub samples: Vec<f64>,
}

impl Epoch {
    pub fn duration(&self) -> usize {
        self.samples.len()
    }

    /// Onset in seconds
    pub fn t0(&self) -> f64 {
        self.start as f64 / self.fs
    }
}
