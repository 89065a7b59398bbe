//! Error types for broker calls, sizing and the replication engine.

use std::time::Duration;

use thiserror::Error;

/// Why a terminal refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidSymbol,
    MarketClosed,
    TradingDisabled,
    InvalidVolume,
    InvalidPrice,
    InvalidStops,
    NoMoney,
    /// Generic "request rejected" from the trade server
    Rejected,
    Requote,
    PriceChanged,
    PositionNotFound,
    /// Any retcode we do not classify
    Other(i32),
}

impl RejectReason {
    /// Map a terminal trade-server retcode.
    pub fn from_retcode(retcode: i32) -> Self {
        match retcode {
            4301 | 4106 => RejectReason::InvalidSymbol,
            10004 => RejectReason::Requote,
            10006 => RejectReason::Rejected,
            10014 => RejectReason::InvalidVolume,
            10015 => RejectReason::InvalidPrice,
            10016 => RejectReason::InvalidStops,
            10017 => RejectReason::TradingDisabled,
            10018 => RejectReason::MarketClosed,
            10019 => RejectReason::NoMoney,
            10020 | 10021 => RejectReason::PriceChanged,
            10036 => RejectReason::PositionNotFound,
            other => RejectReason::Other(other),
        }
    }

    /// Retrying cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RejectReason::InvalidSymbol
                | RejectReason::MarketClosed
                | RejectReason::TradingDisabled
                | RejectReason::InvalidVolume
                | RejectReason::InvalidPrice
                | RejectReason::InvalidStops
                | RejectReason::NoMoney
                | RejectReason::Rejected
                | RejectReason::PositionNotFound
        )
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InvalidSymbol => write!(f, "invalid symbol"),
            RejectReason::MarketClosed => write!(f, "market closed"),
            RejectReason::TradingDisabled => write!(f, "trading disabled"),
            RejectReason::InvalidVolume => write!(f, "invalid volume"),
            RejectReason::InvalidPrice => write!(f, "invalid price"),
            RejectReason::InvalidStops => write!(f, "invalid stops"),
            RejectReason::NoMoney => write!(f, "not enough money"),
            RejectReason::Rejected => write!(f, "request rejected"),
            RejectReason::Requote => write!(f, "requote"),
            RejectReason::PriceChanged => write!(f, "price changed"),
            RejectReason::PositionNotFound => write!(f, "position not found"),
            RejectReason::Other(code) => write!(f, "retcode {}", code),
        }
    }
}

/// Failure of a call against a broker connection.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected ({reason}): {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

impl BrokerError {
    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        BrokerError::Rejected {
            reason,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Connection(_) | BrokerError::Timeout(_) => true,
            BrokerError::Rejected { reason, .. } => !reason.is_permanent(),
        }
    }

    pub fn is_position_not_found(&self) -> bool {
        matches!(
            self,
            BrokerError::Rejected {
                reason: RejectReason::PositionNotFound,
                ..
            }
        )
    }
}

/// Lot sizing failures. None of these are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizingError {
    #[error("master balance must be positive for proportional sizing")]
    InvalidRatio,

    #[error("computed volume is zero after applying lot bounds")]
    ZeroVolume,

    #[error("invalid lot bounds: {0}")]
    InvalidBounds(String),
}

/// Errors surfaced by the replication engine and its stores.
#[derive(Debug, Error)]
pub enum CopierError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Sizing(#[from] SizingError),

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("payload encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CopierError {
    /// Whether a queue entry that failed with this error may be tried again.
    pub fn is_retryable(&self) -> bool {
        match self {
            CopierError::Broker(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Storage failures stop the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CopierError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, CopierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retcode_classification() {
        assert_eq!(RejectReason::from_retcode(10018), RejectReason::MarketClosed);
        assert_eq!(RejectReason::from_retcode(10019), RejectReason::NoMoney);
        assert!(RejectReason::from_retcode(10014).is_permanent());
        assert!(!RejectReason::from_retcode(10004).is_permanent());
        assert!(!RejectReason::from_retcode(10021).is_permanent());
        assert_eq!(RejectReason::from_retcode(12345), RejectReason::Other(12345));
    }

    #[test]
    fn test_retryability() {
        assert!(BrokerError::Connection("reset".into()).is_retryable());
        assert!(BrokerError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(BrokerError::rejected(RejectReason::Other(1), "odd").is_retryable());
        assert!(!BrokerError::rejected(RejectReason::InvalidStops, "bad sl").is_retryable());

        let sizing: CopierError = SizingError::InvalidRatio.into();
        assert!(!sizing.is_retryable());
        assert!(!CopierError::Consistency("missing mapping".into()).is_retryable());
        assert!(CopierError::from(BrokerError::Connection("x".into())).is_retryable());
    }
}
