use serde::{Deserialize, Serialize};

/// What a stage hands downstream when its transform fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Same shape as the input, every sample NaN
    #[default]
    FillNan,

    /// Forward the input unchanged
    PassThrough,

    /// Forward nothing for this block
    Skip,
}
