// Allow uppercase acronyms for industry-standard terms like HDD and SSD
#![allow(clippy::upper_case_acronyms)]

pub mod clock;
pub mod config;
pub mod drives;
pub mod events;
pub mod planner;
pub mod policy;
pub mod probe;
pub mod scheduler;
pub mod snapshot;

// Re-export the main entry points for convenience
pub use clock::{Clock, ManualClock, MonoTime, SystemClock, GRID};
pub use config::{ConfigError, RevenantConfig};
pub use drives::{
    DiscoveredDrive, Drive, DriveConfigUpdate, DriveEnumerator, DriveState, DriveType, ProbeCode,
    ProbeOp, SysinfoEnumerator,
};
pub use events::{Event, EventSink, NdjsonSink, NullSink};
pub use policy::{DenyReason, PolicyInputSource, PolicyInputs, StaticPolicyInputs};
pub use scheduler::{RevenantHandle, SchedulerLoop};
pub use snapshot::Snapshot;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RevenantError {
    #[error("invalid drive letter: {0:?}")]
    InvalidLetter(String),

    #[error("unknown drive: {0}")]
    UnknownDrive(char),

    #[error("scheduler is no longer running")]
    ChannelClosed,

    #[error("cadence search overran its window for drive {0}")]
    PlanOverflow(char),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RevenantResult<T> = Result<T, RevenantError>;
