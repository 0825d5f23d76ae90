use super::SampleBlock;
use anyhow::Result;
use serde_json::Value;

/// Base trait for all streaming pipeline stages.
///
/// A stage runs to completion synchronously for every block it receives and
/// hands its output back to the graph, which forwards it downstream. Stages
/// carry whatever state they need across calls (filter memory, decimation
/// phase, partial windows).
pub trait Stage: Send {
    /// Called once when the stage is instantiated with config from JSON
    fn on_create(&mut self, _config: Value) -> Result<()> {
        Ok(())
    }

    /// Process one block, returning zero or more blocks for downstream stages
    fn process(&mut self, block: SampleBlock) -> Result<Vec<SampleBlock>>;

    /// Drop any carried state (filter memory, partial windows)
    fn reset(&mut self) {}
}
