use super::types::{EngineChannels, EngineConfig};
use anyhow::Result;
use async_trait::async_trait;

/// Data-acquisition hardware as seen by the kernel.
///
/// After `configure`, the engine hands out its channels: analog-input packets
/// arrive every monitor period and analog output is requested ahead of
/// playback, answered through [`EngineChannels::write_ao`].
#[async_trait]
pub trait Engine: Send {
    /// Engine identifier used in logs
    fn name(&self) -> &str;

    async fn configure(&mut self, config: EngineConfig) -> Result<()>;

    /// Start streaming
    async fn start(&mut self) -> Result<()>;

    /// Stop streaming; senders are dropped so readers see a disconnect
    async fn stop(&mut self) -> Result<()>;

    /// Get channels for the acquisition loop
    fn get_channels(&mut self) -> Result<EngineChannels>;

    /// Check if engine is currently streaming
    fn is_running(&self) -> bool;
}
