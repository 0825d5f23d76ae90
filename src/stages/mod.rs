pub mod filter;
pub mod gain;
pub mod level;
pub mod resample;
pub mod transform;

pub use filter::IirFilter;
pub use gain::Gain;
pub use level::{Rms, Spl};
pub use resample::{Blocked, Downsample};
pub use transform::{Transform, TransformFn};
