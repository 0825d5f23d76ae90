pub mod events;
pub mod graph;
pub mod kernel;
pub mod state;

pub use events::{Command, EventBus, KernelEvent, ANY_EVENT};
pub use graph::{GraphOutput, StageGraph};
pub use kernel::{acquire_epochs, AcquisitionKernel, EpochAcquisition, ExtractorBinding};
pub use state::KernelState;
