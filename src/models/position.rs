//! Position snapshots read from a trading terminal.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    /// The opposite side, used for inverted (hedge) slaves.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" | "0" => Ok(Direction::Buy),
            "SELL" | "1" => Ok(Direction::Sell),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// One open position as reported by a broker connection.
///
/// A zero `stop_loss` / `take_profit` means the level is not set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Broker-assigned ticket, unique per account
    pub ticket: i64,

    pub symbol: String,

    pub direction: Direction,

    /// Volume in lots
    pub volume: Decimal,

    #[serde(default)]
    pub open_price: Decimal,

    #[serde(default)]
    pub stop_loss: Decimal,

    #[serde(default)]
    pub take_profit: Decimal,

    /// Order tag; the engine stamps its own on every replicated order
    #[serde(default)]
    pub magic: i64,

    #[serde(default)]
    pub comment: String,
}

impl PositionSnapshot {
    /// True when SL or TP differ from `other`.
    pub fn stops_differ(&self, other: &PositionSnapshot) -> bool {
        self.stop_loss != other.stop_loss || self.take_profit != other.take_profit
    }
}

/// Point-in-time account view returned by `BrokerConnection::snapshot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: Decimal,

    pub equity: Decimal,

    #[serde(default)]
    pub positions: Vec<PositionSnapshot>,

    /// Minimum volume step per symbol, when the broker reports it
    #[serde(default)]
    pub lot_steps: HashMap<String, Decimal>,
}

impl AccountSnapshot {
    /// Positions keyed by ticket.
    pub fn positions_by_ticket(&self) -> HashMap<i64, PositionSnapshot> {
        self.positions
            .iter()
            .map(|p| (p.ticket, p.clone()))
            .collect()
    }

    /// Find a position tagged with the given magic number and comment.
    pub fn find_tagged(&self, magic: i64, comment: &str) -> Option<&PositionSnapshot> {
        self.positions
            .iter()
            .find(|p| p.magic == magic && p.comment == comment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(ticket: i64, magic: i64, comment: &str) -> PositionSnapshot {
        PositionSnapshot {
            ticket,
            symbol: "EURUSD".to_string(),
            direction: Direction::Buy,
            volume: dec!(0.10),
            open_price: dec!(1.0850),
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            magic,
            comment: comment.to_string(),
        }
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("buy".parse::<Direction>().unwrap(), Direction::Buy);
        assert_eq!("SELL".parse::<Direction>().unwrap(), Direction::Sell);
        assert_eq!("1".parse::<Direction>().unwrap(), Direction::Sell);
        assert!("hold".parse::<Direction>().is_err());
        assert_eq!(Direction::Buy.opposite(), Direction::Sell);
    }

    #[test]
    fn test_find_tagged_respects_magic() {
        let snapshot = AccountSnapshot {
            balance: dec!(1000),
            equity: dec!(1000),
            positions: vec![position(1, 0, "CT:42"), position(2, 777, "CT:42")],
            lot_steps: HashMap::new(),
        };

        // A manual trade with the same comment but another magic is not ours
        assert_eq!(snapshot.find_tagged(777, "CT:42").map(|p| p.ticket), Some(2));
        assert!(snapshot.find_tagged(777, "CT:43").is_none());
    }
}
