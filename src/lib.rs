pub mod calibration;
pub mod config;
pub mod core;
pub mod engine;
pub mod extract;
pub mod hal;
pub mod observability;
pub mod queue;
pub mod registry;
pub mod resilience;
pub mod stages;
pub mod store;

pub use config::ExperimentConfig;
pub use engine::{AcquisitionKernel, KernelEvent, StageGraph};
