use super::{MetricsSnapshot, StageMetrics};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct MetricsCollector {
    metrics: HashMap<String, Arc<StageMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage_id: impl Into<String>, metrics: Arc<StageMetrics>) {
        self.metrics.insert(stage_id.into(), metrics);
    }

    /// Merge another collector's stages, prefixing their ids
    pub fn absorb(&mut self, prefix: &str, other: &MetricsCollector) {
        for (id, metrics) in &other.metrics {
            self.metrics
                .insert(format!("{}.{}", prefix, id), metrics.clone());
        }
    }

    pub fn snapshot(&self) -> HashMap<String, MetricsSnapshot> {
        self.metrics
            .iter()
            .map(|(id, metrics)| (id.clone(), metrics.snapshot()))
            .collect()
    }

    pub fn get_stage_metrics(&self, stage_id: &str) -> Option<Arc<StageMetrics>> {
        self.metrics.get(stage_id).cloned()
    }

    /// Plain-text summary for logs
    pub fn report(&self) -> String {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return "No stages registered".to_string();
        }
        let mut ids: Vec<&String> = snapshot.keys().collect();
        ids.sort();

        let mut report = String::from("=== Stage Metrics ===\n");
        for id in ids {
            let m = &snapshot[id];
            report.push_str(&format!(
                "\n[{}]\n  Blocks: {} in / {} out ({} samples)\n  Errors: {} ({} NaN samples)\n  Latency: {}μs avg, {}μs max\n",
                id,
                m.blocks_in,
                m.blocks_out,
                m.samples_in,
                m.errors,
                m.nan_samples,
                m.avg_latency_us,
                m.max_latency_us
            ));
        }
        report
    }
}
