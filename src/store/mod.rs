//! Persistence: calibration tables as CSV and continuous sample streams as
//! memory-mapped binary files.

pub mod continuous;
pub mod table;

pub use continuous::{ContinuousReader, ContinuousWriter};
pub use table::{Table, TableStore};
