pub mod policy;
pub mod signal_queue;
pub mod waveform;

pub use policy::QueuePolicy;
pub use signal_queue::{
    Delays, QueueAppender, QueueEvent, QueueStatus, SignalQueue, Source, Subscriber, TrialInfo,
};
pub use waveform::{
    ChirpFactory, GolayFactory, GolayLeg, SilenceFactory, ToneFactory, WaveformFactory,
};
