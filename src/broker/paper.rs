//! In-process simulated terminal.
//!
//! Fills every order immediately at a fixed price. Used for dry runs and
//! as the broker double in tests: failures can be queued with
//! `fail_next`, the link can be dropped with `set_connected(false)`, and
//! positions can be changed by hand to play the part of a master account.
//! `set_latency` makes every call wait before it answers, like a slow
//! terminal.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use super::{BrokerConnection, OrderRequest};
use crate::error::{BrokerError, RejectReason};
use crate::models::{AccountSnapshot, Direction, PositionSnapshot};

const FIRST_TICKET: i64 = 100_000;
const FILL_PRICE: Decimal = dec!(1.0);

struct PaperState {
    connected: bool,
    balance: Decimal,
    equity: Decimal,
    positions: BTreeMap<i64, PositionSnapshot>,
    next_ticket: i64,
    lot_steps: HashMap<String, Decimal>,
    /// request_id -> ticket of the fill
    filled_requests: HashMap<String, i64>,
    /// Errors returned by the next trading calls, oldest first
    failures: VecDeque<BrokerError>,
    orders_filled: usize,
    latency: Duration,
    reconnects: usize,
}

/// Simulated account that fills every order.
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                connected: true,
                balance,
                equity: balance,
                positions: BTreeMap::new(),
                next_ticket: FIRST_TICKET,
                lot_steps: HashMap::new(),
                filled_requests: HashMap::new(),
                failures: VecDeque::new(),
                orders_filled: 0,
                latency: Duration::ZERO,
                reconnects: 0,
            }),
        }
    }

    pub fn with_equity(self, equity: Decimal) -> Self {
        self.state().equity = equity;
        self
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next open/modify/close fail with `error`.
    pub fn fail_next(&self, error: BrokerError) {
        self.state().failures.push_back(error);
    }

    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    /// Delay applied to every call before it is answered.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn set_balance(&self, balance: Decimal) {
        let mut state = self.state();
        state.balance = balance;
        state.equity = balance;
    }

    pub fn set_lot_step(&self, symbol: &str, step: Decimal) {
        self.state().lot_steps.insert(symbol.to_string(), step);
    }

    /// Open a position directly, as a manual trade on the terminal would.
    pub fn place(
        &self,
        symbol: &str,
        direction: Direction,
        volume: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> i64 {
        let mut state = self.state();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.positions.insert(
            ticket,
            PositionSnapshot {
                ticket,
                symbol: symbol.to_string(),
                direction,
                volume,
                open_price: FILL_PRICE,
                stop_loss,
                take_profit,
                magic: 0,
                comment: String::new(),
            },
        );
        ticket
    }

    /// Change stops of a position by hand.
    pub fn set_stops(&self, ticket: i64, stop_loss: Decimal, take_profit: Decimal) -> bool {
        match self.state().positions.get_mut(&ticket) {
            Some(position) => {
                position.stop_loss = stop_loss;
                position.take_profit = take_profit;
                true
            }
            None => false,
        }
    }

    /// Set the remaining volume of a position by hand.
    pub fn set_volume(&self, ticket: i64, volume: Decimal) -> bool {
        match self.state().positions.get_mut(&ticket) {
            Some(position) => {
                position.volume = volume;
                true
            }
            None => false,
        }
    }

    /// Remove a position by hand.
    pub fn remove(&self, ticket: i64) -> bool {
        self.state().positions.remove(&ticket).is_some()
    }

    pub fn positions(&self) -> Vec<PositionSnapshot> {
        self.state().positions.values().cloned().collect()
    }

    pub fn position(&self, ticket: i64) -> Option<PositionSnapshot> {
        self.state().positions.get(&ticket).cloned()
    }

    /// Orders that produced a new position.
    pub fn orders_filled(&self) -> usize {
        self.state().orders_filled
    }

    pub fn reconnects(&self) -> usize {
        self.state().reconnects
    }

    async fn respond_later(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_link(state: &PaperState) -> Result<(), BrokerError> {
        if state.connected {
            Ok(())
        } else {
            Err(BrokerError::Connection("terminal disconnected".to_string()))
        }
    }

    fn take_failure(state: &mut PaperState) -> Result<(), BrokerError> {
        Self::check_link(state)?;
        match state.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerConnection for PaperBroker {
    async fn snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        self.respond_later().await;
        let state = self.state();
        Self::check_link(&state)?;
        Ok(AccountSnapshot {
            balance: state.balance,
            equity: state.equity,
            positions: state.positions.values().cloned().collect(),
            lot_steps: state.lot_steps.clone(),
        })
    }

    async fn open(&self, order: &OrderRequest) -> Result<i64, BrokerError> {
        self.respond_later().await;
        let mut state = self.state();
        Self::take_failure(&mut state)?;

        if order.volume <= Decimal::ZERO {
            return Err(BrokerError::rejected(
                RejectReason::InvalidVolume,
                format!("volume {} must be positive", order.volume),
            ));
        }

        // Same idempotency key: report the original fill
        if let Some(ticket) = state.filled_requests.get(&order.request_id) {
            return Ok(*ticket);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.positions.insert(
            ticket,
            PositionSnapshot {
                ticket,
                symbol: order.symbol.clone(),
                direction: order.direction,
                volume: order.volume,
                open_price: FILL_PRICE,
                stop_loss: order.stop_loss,
                take_profit: order.take_profit,
                magic: order.magic,
                comment: order.comment.clone(),
            },
        );
        state.filled_requests.insert(order.request_id.clone(), ticket);
        state.orders_filled += 1;

        debug!(ticket, symbol = %order.symbol, volume = %order.volume, "Paper order filled");
        Ok(ticket)
    }

    async fn modify(
        &self,
        ticket: i64,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Result<(), BrokerError> {
        self.respond_later().await;
        let mut state = self.state();
        Self::take_failure(&mut state)?;

        let position = state.positions.get_mut(&ticket).ok_or_else(|| {
            BrokerError::rejected(RejectReason::PositionNotFound, format!("ticket {}", ticket))
        })?;
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        Ok(())
    }

    async fn close(&self, ticket: i64, volume: Option<Decimal>) -> Result<(), BrokerError> {
        self.respond_later().await;
        let mut state = self.state();
        Self::take_failure(&mut state)?;

        let current = state
            .positions
            .get(&ticket)
            .map(|p| p.volume)
            .ok_or_else(|| {
                BrokerError::rejected(RejectReason::PositionNotFound, format!("ticket {}", ticket))
            })?;

        match volume {
            Some(v) if v <= Decimal::ZERO => Err(BrokerError::rejected(
                RejectReason::InvalidVolume,
                format!("close volume {} must be positive", v),
            )),
            Some(v) if v < current => {
                if let Some(position) = state.positions.get_mut(&ticket) {
                    position.volume = current - v;
                }
                Ok(())
            }
            _ => {
                state.positions.remove(&ticket);
                Ok(())
            }
        }
    }

    async fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.connected = true;
        state.reconnects += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(request_id: &str, volume: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: "EURUSD".to_string(),
            direction: Direction::Sell,
            volume,
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            magic: 123456,
            slippage: 20,
            comment: "CT:1".to_string(),
            request_id: request_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent_per_request_id() {
        let broker = PaperBroker::new(dec!(1000));
        let first = broker.open(&order("req-1", dec!(0.2))).await.unwrap();
        let again = broker.open(&order("req-1", dec!(0.2))).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(broker.orders_filled(), 1);
        assert_eq!(broker.positions().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_and_full_close() {
        let broker = PaperBroker::new(dec!(1000));
        let ticket = broker.open(&order("req-1", dec!(0.5))).await.unwrap();

        broker.close(ticket, Some(dec!(0.2))).await.unwrap();
        assert_eq!(broker.position(ticket).unwrap().volume, dec!(0.3));

        broker.close(ticket, None).await.unwrap();
        assert!(broker.position(ticket).is_none());

        let err = broker.close(ticket, None).await.unwrap_err();
        assert!(err.is_position_not_found());
    }

    #[tokio::test]
    async fn test_failure_injection_and_disconnect() {
        let broker = PaperBroker::new(dec!(1000));
        broker.fail_next(BrokerError::rejected(RejectReason::Requote, "requote"));

        let err = broker.open(&order("req-1", dec!(0.1))).await.unwrap_err();
        assert!(err.is_retryable());
        assert_ok_after_failure(&broker).await;

        broker.set_connected(false);
        assert!(matches!(broker.snapshot().await, Err(BrokerError::Connection(_))));
        assert!(!broker.is_connected().await);

        broker.reconnect().await.unwrap();
        assert!(broker.snapshot().await.is_ok());
        assert_eq!(broker.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_latency_delays_answers() {
        let broker = PaperBroker::new(dec!(1000));
        broker.set_latency(Duration::from_millis(200));

        let slow = tokio::time::timeout(Duration::from_millis(20), broker.snapshot()).await;
        assert!(slow.is_err());
        broker.set_latency(Duration::ZERO);
        assert!(broker.snapshot().await.is_ok());
    }

    async fn assert_ok_after_failure(broker: &PaperBroker) {
        assert!(broker.open(&order("req-2", dec!(0.1))).await.is_ok());
    }
}
