use crate::core::SampleBlock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of one stage's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub stage_id: String,
    pub blocks_in: u64,
    pub blocks_out: u64,
    pub samples_in: u64,
    /// NaN samples the stage emitted, degraded blocks included
    pub nan_samples: u64,
    pub errors: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
}

/// Lock-free counters for one stage, written by the acquisition loop and
/// read from the control side
pub struct StageMetrics {
    stage_id: String,
    blocks_in: AtomicU64,
    blocks_out: AtomicU64,
    samples_in: AtomicU64,
    nan_samples: AtomicU64,
    errors: AtomicU64,
    latency_total_us: AtomicU64,
    latency_max_us: AtomicU64,
}

impl StageMetrics {
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            blocks_in: AtomicU64::new(0),
            blocks_out: AtomicU64::new(0),
            samples_in: AtomicU64::new(0),
            nan_samples: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency_total_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
        }
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Account for one input block and whatever the stage produced from it
    pub fn observe(&self, samples_in: usize, outputs: &[SampleBlock], elapsed: Duration) {
        self.blocks_in.fetch_add(1, Ordering::Relaxed);
        self.samples_in.fetch_add(samples_in as u64, Ordering::Relaxed);
        self.blocks_out
            .fetch_add(outputs.len() as u64, Ordering::Relaxed);

        let nan: usize = outputs
            .iter()
            .flat_map(|b| b.data.iter())
            .map(|ch| ch.iter().filter(|v| v.is_nan()).count())
            .sum();
        if nan > 0 {
            self.nan_samples.fetch_add(nan as u64, Ordering::Relaxed);
        }

        let us = elapsed.as_micros() as u64;
        self.latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.latency_max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocks_in(&self) -> u64 {
        self.blocks_in.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn nan_samples(&self) -> u64 {
        self.nan_samples.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let blocks_in = self.blocks_in();
        let total = self.latency_total_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            stage_id: self.stage_id.clone(),
            blocks_in,
            blocks_out: self.blocks_out.load(Ordering::Relaxed),
            samples_in: self.samples_in.load(Ordering::Relaxed),
            nan_samples: self.nan_samples(),
            errors: self.errors(),
            avg_latency_us: if blocks_in == 0 { 0 } else { total / blocks_in },
            max_latency_us: self.latency_max_us.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_nan_output() {
        let metrics = StageMetrics::new("hp");
        let ok = SampleBlock::mono(0, 100.0, vec![1.0, 2.0]);
        metrics.observe(2, &[ok.clone()], Duration::from_micros(10));
        metrics.observe(2, &[ok.nan_like()], Duration::from_micros(30));
        metrics.observe(2, &[], Duration::from_micros(20));

        let s = metrics.snapshot();
        assert_eq!(s.blocks_in, 3);
        assert_eq!(s.blocks_out, 2);
        assert_eq!(s.samples_in, 6);
        assert_eq!(s.nan_samples, 2);
        assert_eq!(s.avg_latency_us, 20);
        assert_eq!(s.max_latency_us, 30);
    }
}
