//! Durable queue entries and their payloads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Open,
    Close,
    Modify,
    PartialClose,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Open => "open",
            OperationType::Close => "close",
            OperationType::Modify => "modify",
            OperationType::PartialClose => "partial_close",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OperationType::Open),
            "close" => Ok(OperationType::Close),
            "modify" => Ok(OperationType::Modify),
            "partial_close" => Ok(OperationType::PartialClose),
            other => Err(format!("unknown operation type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    /// Pending or processing.
    pub fn is_live(&self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::Processing)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(format!("unknown operation status: {}", other)),
        }
    }
}

/// Everything a worker needs to execute an entry, normally sized at
/// enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationPayload {
    Open {
        symbol: String,
        /// Slave side
        direction: Direction,
        /// Slave volume
        volume: Decimal,
        master_volume: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        magic: i64,
        slippage: i32,
        comment: String,
        /// Idempotency key sent with the order
        request_id: String,
        /// Set when the slave balance was unknown at enqueue time: the
        /// worker sizes the order against this master balance instead of
        /// using `volume`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        master_balance: Option<Decimal>,
    },
    Close {
        reason: String,
    },
    Modify {
        stop_loss: Decimal,
        take_profit: Decimal,
    },
    PartialClose {
        /// Master volume closed in this step
        closed_volume: Decimal,
        /// Master volume before the close
        original_volume: Decimal,
    },
}

impl OperationPayload {
    pub fn operation_type(&self) -> OperationType {
        match self {
            OperationPayload::Open { .. } => OperationType::Open,
            OperationPayload::Close { .. } => OperationType::Close,
            OperationPayload::Modify { .. } => OperationType::Modify,
            OperationPayload::PartialClose { .. } => OperationType::PartialClose,
        }
    }
}

/// Comment stamped on every order replicating `master_ticket`.
pub fn order_comment(master_ticket: i64) -> String {
    format!("CT:{}", master_ticket)
}

/// A row of the operation queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedOperation {
    pub id: i64,
    pub operation_type: OperationType,
    pub master_ticket: i64,
    pub slave_name: String,
    pub payload: OperationPayload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: OperationStatus,
    pub error_message: Option<String>,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Reclaimed from `processing` after an interrupted run
    pub recovered: bool,
}

/// Queue counts by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn live(&self) -> i64 {
        self.pending + self.processing
    }
}
