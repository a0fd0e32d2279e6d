pub mod acquisition;
pub mod slot;
pub mod throughput;

pub use acquisition::{
    AcquisitionLoop, AcquisitionOptions, AcquisitionService, AcquisitionState, LoopState,
    StartError,
};
pub use slot::{AcquisitionStats, LatestSlot};
pub use throughput::ThroughputSample;
