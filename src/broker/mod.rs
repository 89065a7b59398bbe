//! Broker connections: the capability the engine drives on every account.
//!
//! The engine only needs a handful of calls from a trading terminal:
//! read the account, place an order, change stops, close (fully or
//! partially) and reconnect. Two implementations ship with the crate:
//! - `PaperBroker`, an in-process simulated terminal
//! - `HttpBroker`, a JSON client for a terminal bridge process

mod http;
mod paper;

pub use http::HttpBroker;
pub use paper::PaperBroker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::BrokerError;
use crate::models::{AccountSnapshot, ConnectionDescriptor, Direction};

/// A market order as sent to a terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    /// Zero means no stop loss
    pub stop_loss: Decimal,
    /// Zero means no take profit
    pub take_profit: Decimal,
    pub magic: i64,
    /// Allowed deviation in points
    pub slippage: i32,
    pub comment: String,
    /// Idempotency key; terminals that support it never fill the same key twice
    pub request_id: String,
}

/// Operations the engine performs against one trading account.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Balance, equity and open positions.
    async fn snapshot(&self) -> Result<AccountSnapshot, BrokerError>;

    /// Place a market order; returns the new position ticket.
    async fn open(&self, order: &OrderRequest) -> Result<i64, BrokerError>;

    /// Set SL/TP on an open position.
    async fn modify(
        &self,
        ticket: i64,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Result<(), BrokerError>;

    /// Close `volume` lots of a position, or all of it when `None`.
    async fn close(&self, ticket: i64, volume: Option<Decimal>) -> Result<(), BrokerError>;

    async fn is_connected(&self) -> bool;

    async fn reconnect(&self) -> Result<(), BrokerError>;
}

/// Build a connection from its configuration.
pub fn connect(
    descriptor: &ConnectionDescriptor,
    timeout: Duration,
) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
    match descriptor {
        ConnectionDescriptor::Paper { balance, equity } => {
            let mut broker = PaperBroker::new(*balance);
            if let Some(equity) = equity {
                broker = broker.with_equity(*equity);
            }
            Ok(Arc::new(broker))
        }
        ConnectionDescriptor::Http {
            base_url,
            login,
            password,
            server,
        } => {
            let broker = HttpBroker::new(
                base_url.clone(),
                *login,
                password.clone(),
                server.clone(),
                timeout,
            )?;
            Ok(Arc::new(broker))
        }
    }
}

/// Bound a broker call; expiry is a retryable `Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct Stalled;

    #[async_trait]
    impl BrokerConnection for Stalled {
        async fn snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(AccountSnapshot::default())
        }
        async fn open(&self, _order: &OrderRequest) -> Result<i64, BrokerError> {
            Ok(1)
        }
        async fn modify(&self, _: i64, _: Decimal, _: Decimal) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn close(&self, _: i64, _: Option<Decimal>) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            true
        }
        async fn reconnect(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let broker = Stalled;
        let result = with_timeout(Duration::from_millis(20), broker.snapshot()).await;
        assert!(matches!(result, Err(BrokerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_connect_paper() {
        let descriptor = ConnectionDescriptor::Paper {
            balance: dec!(2500),
            equity: Some(dec!(2400)),
        };
        let broker = connect(&descriptor, Duration::from_secs(1)).unwrap();
        let snapshot = broker.snapshot().await.unwrap();
        assert_eq!(snapshot.balance, dec!(2500));
        assert_eq!(snapshot.equity, dec!(2400));
        assert!(snapshot.positions.is_empty());
    }
}
