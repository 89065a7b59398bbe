//! Master/slave trade copier.
//!
//! Watches one trading account (the master) and mirrors every position it
//! opens, modifies, partially closes or closes onto a set of slave
//! accounts, each with its own sizing rules. Replication state lives in
//! SQLite so work survives crashes and disconnects.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod trading;

pub use config::AppConfig;
pub use error::{BrokerError, CopierError, RejectReason, Result, SizingError};
pub use trading::{Engine, EngineSettings};
