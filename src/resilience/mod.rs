pub mod guarded_stage;
pub mod policy;

pub use guarded_stage::GuardedStage;
pub use policy::ErrorPolicy;
