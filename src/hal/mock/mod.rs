pub mod simulated;

pub use simulated::{LoopbackSettings, SimulatedEngine};
