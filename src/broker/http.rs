//! Client for a terminal bridge exposing a small JSON API.
//!
//! Endpoints:
//! - `GET  /account`                  account snapshot
//! - `POST /orders`                   market order, `Idempotency-Key` header
//! - `POST /positions/{ticket}/modify`
//! - `POST /positions/{ticket}/close`
//! - `POST /connect`                  (re)attach the terminal session
//! - `GET  /health`
//!
//! Errors come back as `{"retcode": 10018, "message": "..."}`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{BrokerConnection, OrderRequest};
use crate::error::{BrokerError, RejectReason};
use crate::models::AccountSnapshot;

/// Retcode the terminal uses for "no connection to trade server".
const RETCODE_NO_CONNECTION: i32 = 10031;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    retcode: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    ticket: i64,
}

#[derive(Debug, Serialize)]
struct ModifyRequest {
    stop_loss: Decimal,
    take_profit: Decimal,
}

#[derive(Debug, Serialize)]
struct CloseRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    volume: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    login: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<String>,
}

/// Broker connection backed by an HTTP terminal bridge.
pub struct HttpBroker {
    client: Client,
    base_url: String,
    credentials: ConnectRequest,
    connected: AtomicBool,
    /// Upper bound on time spent retrying in `reconnect`
    reconnect_budget: Duration,
}

impl HttpBroker {
    pub fn new(
        base_url: String,
        login: Option<i64>,
        password: Option<String>,
        server: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Connection(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: ConnectRequest {
                login,
                password,
                server,
            },
            connected: AtomicBool::new(true),
            reconnect_budget: timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Record the link state from the outcome of a call.
    fn track<T>(&self, result: Result<T, BrokerError>) -> Result<T, BrokerError> {
        match &result {
            Ok(_) => self.connected.store(true, Ordering::Relaxed),
            Err(BrokerError::Connection(_)) | Err(BrokerError::Timeout(_)) => {
                self.connected.store(false, Ordering::Relaxed)
            }
            Err(_) => {}
        }
        result
    }

    async fn check(response: Response) -> Result<Response, BrokerError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(error_from_response(status, &body))
    }

    async fn connect_once(&self) -> Result<(), BrokerError> {
        let response = self
            .client
            .post(self.url("/connect"))
            .json(&self.credentials)
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response).await?;
        Ok(())
    }

    /// `GET /health`; true when the bridge answers 2xx.
    pub async fn health(&self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl BrokerConnection for HttpBroker {
    async fn snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        let result = async {
            let response = self
                .client
                .get(self.url("/account"))
                .send()
                .await
                .map_err(transport_error)?;
            Self::check(response)
                .await?
                .json::<AccountSnapshot>()
                .await
                .map_err(|e| BrokerError::Connection(format!("malformed account response: {}", e)))
        }
        .await;
        self.track(result)
    }

    async fn open(&self, order: &OrderRequest) -> Result<i64, BrokerError> {
        debug!(symbol = %order.symbol, volume = %order.volume, request_id = %order.request_id, "Sending order");
        let result = async {
            let response = self
                .client
                .post(self.url("/orders"))
                .header("Idempotency-Key", &order.request_id)
                .json(order)
                .send()
                .await
                .map_err(transport_error)?;
            let body: OrderResponse = Self::check(response)
                .await?
                .json()
                .await
                .map_err(|e| BrokerError::Connection(format!("malformed order response: {}", e)))?;
            Ok::<_, BrokerError>(body.ticket)
        }
        .await;
        self.track(result)
    }

    async fn modify(
        &self,
        ticket: i64,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Result<(), BrokerError> {
        let result = async {
            let response = self
                .client
                .post(self.url(&format!("/positions/{}/modify", ticket)))
                .json(&ModifyRequest {
                    stop_loss,
                    take_profit,
                })
                .send()
                .await
                .map_err(transport_error)?;
            Self::check(response).await?;
            Ok::<_, BrokerError>(())
        }
        .await;
        self.track(result)
    }

    async fn close(&self, ticket: i64, volume: Option<Decimal>) -> Result<(), BrokerError> {
        let result = async {
            let response = self
                .client
                .post(self.url(&format!("/positions/{}/close", ticket)))
                .json(&CloseRequest { volume })
                .send()
                .await
                .map_err(transport_error)?;
            Self::check(response).await?;
            Ok::<_, BrokerError>(())
        }
        .await;
        self.track(result)
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(self.reconnect_budget))
            .build();

        let result = backoff::future::retry(policy, || async {
            self.connect_once().await.map_err(|e| {
                if e.is_retryable() {
                    warn!(url = %self.base_url, error = %e, "Reconnect attempt failed");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await;

        if result.is_ok() {
            info!(url = %self.base_url, "Terminal bridge reconnected");
        }
        self.track(result)
    }
}

fn transport_error(error: reqwest::Error) -> BrokerError {
    if error.is_timeout() {
        BrokerError::Timeout(Duration::ZERO)
    } else {
        BrokerError::Connection(error.to_string())
    }
}

/// Classify a non-2xx bridge response.
fn error_from_response(status: StatusCode, body: &str) -> BrokerError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) if err.retcode == RETCODE_NO_CONNECTION => BrokerError::Connection(err.message),
        Ok(err) => BrokerError::rejected(RejectReason::from_retcode(err.retcode), err.message),
        Err(_) if status.is_server_error() => {
            BrokerError::Connection(format!("{} - {}", status, body))
        }
        Err(_) if status == StatusCode::NOT_FOUND => {
            BrokerError::rejected(RejectReason::PositionNotFound, body.to_string())
        }
        Err(_) => BrokerError::rejected(
            RejectReason::Other(i32::from(status.as_u16())),
            format!("{} - {}", status, body),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_classification() {
        let err = error_from_response(
            StatusCode::BAD_REQUEST,
            r#"{"retcode": 10018, "message": "Market is closed"}"#,
        );
        assert!(matches!(
            err,
            BrokerError::Rejected {
                reason: RejectReason::MarketClosed,
                ..
            }
        ));
        assert!(!err.is_retryable());

        let err = error_from_response(
            StatusCode::BAD_REQUEST,
            r#"{"retcode": 10031, "message": "No connection"}"#,
        );
        assert!(matches!(err, BrokerError::Connection(_)));

        let err = error_from_response(StatusCode::BAD_GATEWAY, "upstream down");
        assert!(err.is_retryable());

        let err = error_from_response(StatusCode::NOT_FOUND, "no such position");
        assert!(err.is_position_not_found());
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_connection_error() {
        let broker = HttpBroker::new(
            "http://127.0.0.1:9".to_string(),
            None,
            None,
            None,
            Duration::from_millis(300),
        )
        .unwrap();

        assert!(!broker.health().await);
        let err = broker.snapshot().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!broker.is_connected().await);
    }
}
