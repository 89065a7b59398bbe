//! Data models for accounts, positions, mappings, queue entries and audit records.

mod account;
mod audit;
mod mapping;
mod operation;
mod position;

pub use account::{
    AccountRole, AccountState, ConnectionDescriptor, LotMode, MasterConfig, SlaveConfig,
    SlaveUpdate, SymbolFilter,
};
pub use audit::{AuditEvent, AuditRecord};
pub use mapping::{MappingStatus, PositionMapping, PositionStats};
pub use operation::{
    order_comment, OperationPayload, OperationStatus, OperationType, QueueStats, QueuedOperation,
};
pub use position::{AccountSnapshot, Direction, PositionSnapshot};
