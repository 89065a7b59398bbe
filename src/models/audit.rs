//! Audit trail records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Kinds of events written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    PositionOpened,
    PositionClosed,
    PositionModified,
    PartialClose,
    OperationRetry,
    OperationFailed,
    OperationRecovered,
    DuplicateOpenAdopted,
    SizingSkipped,
    VolumeIncreaseIgnored,
    StartupReconciled,
    SlaveAdded,
    SlaveUpdated,
    SlaveEnabled,
    SlaveDisabled,
    SlaveRemoved,
    AccountReconnected,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::PositionOpened => "position_opened",
            AuditEvent::PositionClosed => "position_closed",
            AuditEvent::PositionModified => "position_modified",
            AuditEvent::PartialClose => "partial_close",
            AuditEvent::OperationRetry => "operation_retry",
            AuditEvent::OperationFailed => "operation_failed",
            AuditEvent::OperationRecovered => "operation_recovered",
            AuditEvent::DuplicateOpenAdopted => "duplicate_open_adopted",
            AuditEvent::SizingSkipped => "sizing_skipped",
            AuditEvent::VolumeIncreaseIgnored => "volume_increase_ignored",
            AuditEvent::StartupReconciled => "startup_reconciled",
            AuditEvent::SlaveAdded => "slave_added",
            AuditEvent::SlaveUpdated => "slave_updated",
            AuditEvent::SlaveEnabled => "slave_enabled",
            AuditEvent::SlaveDisabled => "slave_disabled",
            AuditEvent::SlaveRemoved => "slave_removed",
            AuditEvent::AccountReconnected => "account_reconnected",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored audit row.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub event_type: String,
    pub master_ticket: Option<i64>,
    pub slave_name: Option<String>,
    pub slave_ticket: Option<i64>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
