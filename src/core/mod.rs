pub mod block;
pub mod epoch;
pub mod stage;

pub use block::SampleBlock;
pub use epoch::{Epoch, EpochRequest, Metadata};
pub use stage::Stage;
