pub mod mock;
pub mod traits;
pub mod types;

pub use mock::{LoopbackSettings, SimulatedEngine};
pub use traits::Engine;
pub use types::{
    AiPacket, AoPacket, AoRequest, Channel, ChannelConfig, Direction, EngineChannels,
    EngineConfig,
};
