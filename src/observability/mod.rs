pub mod collector;
pub mod metrics;

pub use collector::MetricsCollector;
pub use metrics::{MetricsSnapshot, StageMetrics};
