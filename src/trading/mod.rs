//! Replication: change detection, lot sizing, the account registry, the
//! engine and its per-slave drain workers.

mod admin;
mod config;
mod detector;
mod engine;
mod lot_sizer;
mod registry;
mod worker;

#[cfg(test)]
mod testing;

pub use admin::EngineStatus;
pub use config::EngineSettings;
pub use detector::{ChangeDetector, ChangeSet, PartialClose, VolumeIncrease};
pub use engine::{CycleReport, Engine, EngineStats};
pub use lot_sizer::{compute_slave_volume, partial_close_volume, raw_volume};
pub use registry::{AccountRegistry, DrainGate, MasterAccount, SlaveAccount, SlaveView};
pub use worker::{DrainOutcome, SlaveWorker};
