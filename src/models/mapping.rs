//! Master ticket to slave ticket mappings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// Lifecycle of a mapping. Only `Open` rows ever change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Open,
    Closed,
    Error,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Open => "open",
            MappingStatus::Closed => "closed",
            MappingStatus::Error => "error",
        }
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(MappingStatus::Open),
            "closed" => Ok(MappingStatus::Closed),
            "error" => Ok(MappingStatus::Error),
            other => Err(format!("unknown mapping status: {}", other)),
        }
    }
}

/// Link between one master position and its copy on one slave.
#[derive(Debug, Clone, Serialize)]
pub struct PositionMapping {
    pub id: i64,

    pub master_ticket: i64,

    pub slave_name: String,

    /// Absent when the copy failed before any order existed
    pub slave_ticket: Option<i64>,

    pub symbol: String,

    pub master_volume: Decimal,

    pub slave_volume: Decimal,

    /// Side of the slave position (already inverted for hedge slaves)
    pub direction: Direction,

    pub status: MappingStatus,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub closed_at: Option<DateTime<Utc>>,
}

impl PositionMapping {
    pub fn is_open(&self) -> bool {
        self.status == MappingStatus::Open
    }
}

/// Aggregate counts over the mapping store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PositionStats {
    /// Distinct master tickets with at least one open copy
    pub total_master_positions: i64,
    /// Open slave positions
    pub total_slave_positions: i64,
    pub positions_by_slave: Vec<(String, i64)>,
    pub positions_by_symbol: Vec<(String, i64)>,
    pub mappings_by_status: Vec<(String, i64)>,
}
