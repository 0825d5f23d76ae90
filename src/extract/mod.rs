pub mod extractor;
pub mod reject;

pub use extractor::{
    queue_subscriber, request_from_trial, EpochExtractor, ExtractorConfig, ExtractorMessage,
    ExtractorState,
};
pub use reject::{ArtifactReject, EpochCounts, RejectMode};
