use super::ErrorPolicy;
use crate::core::{SampleBlock, Stage};
use crate::observability::StageMetrics;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Stage wrapper that never lets an error out of the graph.
///
/// Failures, panics included, are counted, logged and replaced according to
/// the policy.
pub struct GuardedStage {
    id: String,
    inner: Box<dyn Stage>,
    metrics: Arc<StageMetrics>,
    error_policy: ErrorPolicy,
}

impl GuardedStage {
    pub fn new(
        id: impl Into<String>,
        inner: Box<dyn Stage>,
        metrics: Arc<StageMetrics>,
        error_policy: ErrorPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            inner,
            metrics,
            error_policy,
        }
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        self.metrics.clone()
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }
}

impl Stage for GuardedStage {
    fn on_create(&mut self, config: Value) -> Result<()> {
        self.inner.on_create(config)
    }

    fn process(&mut self, block: SampleBlock) -> Result<Vec<SampleBlock>> {
        let start = Instant::now();
        let samples = block.n_samples();

        let inner = &mut self.inner;
        let input = block.clone();
        let result = panic::catch_unwind(AssertUnwindSafe(move || inner.process(input)))
            .unwrap_or_else(|_| Err(anyhow!("stage panicked")));

        match result {
            Ok(output) => {
                self.metrics.observe(samples, &output, start.elapsed());
                Ok(output)
            }
            Err(e) => {
                self.metrics.record_error();
                tracing::warn!(
                    stage = %self.id,
                    s0 = block.s0,
                    policy = ?self.error_policy,
                    error = %e,
                    "stage failed, degrading output"
                );
                let output = match self.error_policy {
                    ErrorPolicy::FillNan => vec![block.nan_like()],
                    ErrorPolicy::PassThrough => vec![block],
                    ErrorPolicy::Skip => Vec::new(),
                };
                self.metrics.observe(samples, &output, start.elapsed());
                Ok(output)
            }
        }
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Failing;

    impl Stage for Failing {
        fn process(&mut self, _block: SampleBlock) -> Result<Vec<SampleBlock>> {
            bail!("sensor excursion")
        }
    }

    #[test]
    fn test_fill_nan_keeps_going() {
        let metrics = Arc::new(StageMetrics::new("f"));
        let mut stage = GuardedStage::new("f", Box::new(Failing), metrics.clone(), ErrorPolicy::FillNan);
        let out = stage
            .process(SampleBlock::mono(3, 10.0, vec![1.0, 2.0]))
            .unwrap();
        assert_eq!(out[0].s0, 3);
        assert!(out[0].channel(0).iter().all(|v| v.is_nan()));
        assert_eq!(metrics.errors(), 1);
        assert_eq!(metrics.nan_samples(), 2);
    }

    struct Panicking;

    impl Stage for Panicking {
        fn process(&mut self, block: SampleBlock) -> Result<Vec<SampleBlock>> {
            let _ = block.channel(0)[10];
            Ok(vec![block])
        }
    }

    #[test]
    fn test_panic_contained() {
        let metrics = Arc::new(StageMetrics::new("p"));
        let mut stage = GuardedStage::new("p", Box::new(Panicking), metrics.clone(), ErrorPolicy::FillNan);
        let out = stage.process(SampleBlock::mono(0, 1.0, vec![1.0])).unwrap();
        assert!(out[0].channel(0)[0].is_nan());
        assert_eq!(metrics.errors(), 1);
    }

    #[test]
    fn test_skip_and_pass_through() {
        let metrics = Arc::new(StageMetrics::new("f"));
        let mut skip = GuardedStage::new("f", Box::new(Failing), metrics.clone(), ErrorPolicy::Skip);
        assert!(skip.process(SampleBlock::mono(0, 1.0, vec![1.0])).unwrap().is_empty());

        let mut pass = GuardedStage::new("f", Box::new(Failing), metrics, ErrorPolicy::PassThrough);
        let out = pass.process(SampleBlock::mono(0, 1.0, vec![1.0])).unwrap();
        assert_eq!(out[0].channel(0), &[1.0]);
    }
}
