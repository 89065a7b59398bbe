//! Per-slave drain worker.
//!
//! Each slave gets one worker task. It claims the next due queue entry for
//! its slave, executes it against the slave's connection (one call in
//! flight at a time), and settles the outcome: the queue row, the mapping
//! and the audit row change in one transaction.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::SqliteConnection;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::broker::{with_timeout, BrokerConnection, OrderRequest};
use crate::db::{self, AuditEntry, Database, NewMapping};
use crate::error::{BrokerError, CopierError, Result};
use crate::models::{AccountSnapshot, AuditEvent, OperationPayload, PositionMapping, QueuedOperation};

use super::lot_sizer::{compute_slave_volume, partial_close_volume};
use super::registry::{AccountRegistry, DrainGate, SlaveView};
use super::EngineSettings;

/// What one `drain_once` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// Nothing claimable
    Idle,
    Completed { id: i64 },
    Retrying { id: i64, attempts: u32 },
    Failed { id: i64, error: String },
    /// Fenced work is done and the slave left the registry
    Removed,
}

/// Result of a broker-side execution, before settlement.
#[derive(Debug, Clone, PartialEq)]
enum Executed {
    Opened {
        ticket: i64,
        volume: Decimal,
        adopted: bool,
    },
    Closed {
        ticket: i64,
        already_gone: bool,
    },
    Modified {
        ticket: i64,
    },
    PartiallyClosed {
        ticket: i64,
        closed: Decimal,
        remaining_slave: Decimal,
        remaining_master: Decimal,
    },
    /// The mapping is no longer open; nothing to do
    Skipped(String),
}

/// Slot where a worker parks a process-fatal error for the engine.
pub(crate) type FatalSlot = Arc<Mutex<Option<CopierError>>>;

/// Drains the queue of one slave.
pub struct SlaveWorker {
    name: String,
    db: Database,
    registry: Arc<AccountRegistry>,
    settings: EngineSettings,
}

impl SlaveWorker {
    pub fn new(
        name: String,
        db: Database,
        registry: Arc<AccountRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            name,
            db,
            registry,
            settings,
        }
    }

    /// Worker loop: drain until idle, then wait for an enqueue, a drain
    /// tick or shutdown.
    pub(crate) async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        shutdown_tx: Arc<watch::Sender<bool>>,
        fatal: FatalSlot,
    ) {
        let Some(wakeup) = self.registry.wakeup_handle(&self.name).await else {
            return;
        };
        info!(slave = %self.name, "Drain worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.drain_once().await {
                Ok(DrainOutcome::Idle) => {
                    tokio::select! {
                        _ = wakeup.notified() => {}
                        _ = tokio::time::sleep(self.settings.drain_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(DrainOutcome::Removed) => break,
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(slave = %self.name, error = %e, "Storage failure in drain worker, stopping engine");
                    fatal.lock().await.get_or_insert(e);
                    shutdown_tx.send_replace(true);
                    break;
                }
                Err(e) => {
                    error!(slave = %self.name, error = %e, "Drain error");
                    tokio::time::sleep(self.settings.drain_interval()).await;
                }
            }
        }

        info!(slave = %self.name, "Drain worker stopped");
    }

    /// Claim and settle at most one entry.
    pub async fn drain_once(&self) -> Result<DrainOutcome> {
        if !self.registry.contains_slave(&self.name).await {
            return Ok(DrainOutcome::Removed);
        }

        let fence = match self.registry.drain_gate(&self.name).await {
            DrainGate::Open => None,
            DrainGate::Closed => return Ok(DrainOutcome::Idle),
            DrainGate::Fenced(fence) => {
                if self.db.live_count_up_to(&self.name, fence).await? == 0 {
                    return self.finish_fenced_drain().await;
                }
                Some(fence)
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        let Some(op) = self.db.claim_next(&self.name, now_ms, fence).await? else {
            return Ok(DrainOutcome::Idle);
        };

        debug!(
            slave = %self.name,
            id = op.id,
            operation = %op.operation_type,
            master_ticket = op.master_ticket,
            attempts = op.attempts,
            "Claimed queue entry"
        );

        let Some(slave) = self.registry.slave(&self.name).await else {
            let error = "slave removed".to_string();
            let mut tx = self.db.begin().await?;
            db::fail_operation(&mut tx, op.id, op.attempts, &error).await?;
            abandon_operation(&mut tx, &op, &self.name, op.attempts, &error).await?;
            tx.commit().await?;
            return Ok(DrainOutcome::Failed { id: op.id, error });
        };

        let result = self.execute(&slave, &op).await;
        self.settle(&slave, &op, result).await
    }

    /// Fenced entries are all terminal: drop the fence, and the slave too
    /// when it was being removed.
    async fn finish_fenced_drain(&self) -> Result<DrainOutcome> {
        let removing = self
            .registry
            .with_slave(&self.name, |slave| {
                slave.drain_fence = None;
                slave.pending_removal
            })
            .await
            .unwrap_or(false);

        if !removing {
            info!(slave = %self.name, "Disabled slave drained");
            return Ok(DrainOutcome::Idle);
        }

        self.registry.take_slave(&self.name).await;
        self.db
            .record(
                AuditEntry::new(AuditEvent::SlaveRemoved)
                    .slave(&self.name)
                    .details(json!({"closed_positions": true})),
            )
            .await?;
        info!(slave = %self.name, "Slave removed after closing its positions");
        Ok(DrainOutcome::Removed)
    }

    // ==================== Execution ====================

    async fn execute(&self, slave: &SlaveView, op: &QueuedOperation) -> Result<Executed> {
        let timeout = self.settings.broker_timeout();
        let connection = &slave.connection;

        match &op.payload {
            OperationPayload::Open {
                symbol,
                direction,
                volume,
                master_volume,
                stop_loss,
                take_profit,
                magic,
                slippage,
                comment,
                request_id,
                master_balance,
            } => {
                // The order may have reached the terminal before a crash or
                // a lost response; adopt it instead of sending another
                let resumed = op.attempts > 0 || op.recovered;
                let snapshot = if resumed || master_balance.is_some() {
                    Some(with_timeout(timeout, connection.snapshot()).await?)
                } else {
                    None
                };
                if let Some(snapshot) = &snapshot {
                    if resumed {
                        if let Some(existing) = snapshot.find_tagged(*magic, comment) {
                            return Ok(Executed::Opened {
                                ticket: existing.ticket,
                                volume: existing.volume,
                                adopted: true,
                            });
                        }
                    }
                }

                let volume = match (master_balance, &snapshot) {
                    (Some(master_balance), Some(snapshot)) => {
                        self.size_on_execute(slave, symbol, *master_volume, *master_balance, snapshot)
                            .await?
                    }
                    _ => *volume,
                };

                let order = OrderRequest {
                    symbol: symbol.clone(),
                    direction: *direction,
                    volume,
                    stop_loss: *stop_loss,
                    take_profit: *take_profit,
                    magic: *magic,
                    slippage: *slippage,
                    comment: comment.clone(),
                    request_id: request_id.clone(),
                };
                let ticket = with_timeout(timeout, connection.open(&order)).await?;
                Ok(Executed::Opened {
                    ticket,
                    volume,
                    adopted: false,
                })
            }

            OperationPayload::Close { .. } => {
                let mapping = match self.open_mapping(op).await? {
                    Ok(mapping) => mapping,
                    Err(skip) => return Ok(skip),
                };
                let ticket = slave_ticket(&mapping)?;
                close_fully(connection.as_ref(), ticket, timeout).await
            }

            OperationPayload::Modify {
                stop_loss,
                take_profit,
            } => {
                let mapping = match self.open_mapping(op).await? {
                    Ok(mapping) => mapping,
                    Err(skip) => return Ok(skip),
                };
                let ticket = slave_ticket(&mapping)?;
                with_timeout(timeout, connection.modify(ticket, *stop_loss, *take_profit)).await?;
                Ok(Executed::Modified { ticket })
            }

            OperationPayload::PartialClose {
                closed_volume,
                original_volume,
            } => {
                let mapping = match self.open_mapping(op).await? {
                    Ok(mapping) => mapping,
                    Err(skip) => return Ok(skip),
                };
                let ticket = slave_ticket(&mapping)?;
                let step = slave
                    .state
                    .lot_step(&mapping.symbol, self.settings.default_lot_step);
                let volume = partial_close_volume(
                    *closed_volume,
                    *original_volume,
                    mapping.slave_volume,
                    step,
                );

                if volume >= mapping.slave_volume {
                    return close_fully(connection.as_ref(), ticket, timeout).await;
                }

                with_timeout(timeout, connection.close(ticket, Some(volume))).await?;
                Ok(Executed::PartiallyClosed {
                    ticket,
                    closed: volume,
                    remaining_slave: mapping.slave_volume - volume,
                    remaining_master: (*original_volume - *closed_volume).max(Decimal::ZERO),
                })
            }
        }
    }

    /// Size an open whose slave balance was unknown when it was queued,
    /// from a fresh slave snapshot. Sizing errors are permanent.
    async fn size_on_execute(
        &self,
        slave: &SlaveView,
        symbol: &str,
        master_volume: Decimal,
        master_balance: Decimal,
        snapshot: &AccountSnapshot,
    ) -> Result<Decimal> {
        let mut state = slave.state.clone();
        state.update_from_snapshot(snapshot);
        let step = state.lot_step(symbol, self.settings.default_lot_step);
        self.registry
            .update_slave_state(&self.name, |current| current.update_from_snapshot(snapshot))
            .await;

        let volume = compute_slave_volume(
            master_volume,
            master_balance,
            snapshot.balance,
            &slave.config,
            step,
        )?;
        debug!(
            slave = %self.name,
            symbol,
            balance = %snapshot.balance,
            volume = %volume,
            "Sized open at execution"
        );
        Ok(volume)
    }

    /// The open mapping an operation acts on, or the skip to settle with.
    async fn open_mapping(
        &self,
        op: &QueuedOperation,
    ) -> Result<std::result::Result<PositionMapping, Executed>> {
        match self.db.get_mapping(op.master_ticket, &self.name).await? {
            Some(mapping) if mapping.is_open() => Ok(Ok(mapping)),
            Some(mapping) => Ok(Err(Executed::Skipped(format!(
                "mapping is {}",
                mapping.status
            )))),
            None => Err(CopierError::Consistency(format!(
                "{} for master {} on {} has no mapping",
                op.operation_type, op.master_ticket, self.name
            ))),
        }
    }

    // ==================== Settlement ====================

    async fn settle(
        &self,
        slave: &SlaveView,
        op: &QueuedOperation,
        result: Result<Executed>,
    ) -> Result<DrainOutcome> {
        let error = match result {
            Ok(executed) => match self.settle_success(op, &executed).await {
                Ok(()) => {
                    self.log_success(op, &executed);
                    return Ok(DrainOutcome::Completed { id: op.id });
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        if error.is_fatal() {
            return Err(error);
        }

        if let CopierError::Broker(BrokerError::Connection(_) | BrokerError::Timeout(_)) = &error {
            let message = error.to_string();
            self.registry
                .update_slave_state(&slave.config.name, |state| state.record_error(&message))
                .await;
        }

        self.settle_failure(op, &error).await
    }

    async fn settle_success(&self, op: &QueuedOperation, executed: &Executed) -> Result<()> {
        let mut tx = self.db.begin().await?;
        db::complete_operation(&mut tx, op.id).await?;

        match (executed, &op.payload) {
            (
                Executed::Opened {
                    ticket,
                    volume,
                    adopted,
                },
                OperationPayload::Open {
                    symbol,
                    direction,
                    master_volume,
                    request_id,
                    ..
                },
            ) => {
                db::insert_mapping(
                    &mut tx,
                    &NewMapping {
                        master_ticket: op.master_ticket,
                        slave_name: self.name.clone(),
                        slave_ticket: Some(*ticket),
                        symbol: symbol.clone(),
                        master_volume: *master_volume,
                        slave_volume: *volume,
                        direction: *direction,
                    },
                )
                .await?;

                if *adopted {
                    db::log_event(
                        &mut tx,
                        &self
                            .audit(AuditEvent::DuplicateOpenAdopted, op, Some(*ticket))
                            .details(json!({"request_id": request_id, "recovered": op.recovered})),
                    )
                    .await?;
                }

                db::log_event(
                    &mut tx,
                    &self
                        .audit(AuditEvent::PositionOpened, op, Some(*ticket))
                        .details(json!({
                            "symbol": symbol,
                            "direction": direction,
                            "volume": volume,
                            "master_volume": master_volume,
                        })),
                )
                .await?;
            }

            (Executed::Opened { .. }, _) => {
                return Err(CopierError::Consistency(format!(
                    "entry {} opened a position without an open payload",
                    op.id
                )));
            }

            (Executed::Closed { ticket, already_gone }, payload) => {
                db::close_mapping(&mut tx, op.master_ticket, &self.name).await?;
                let reason = match payload {
                    OperationPayload::Close { reason } => reason.as_str(),
                    _ => "partial close covered the whole slave volume",
                };
                db::log_event(
                    &mut tx,
                    &self
                        .audit(AuditEvent::PositionClosed, op, Some(*ticket))
                        .details(json!({"reason": reason, "already_gone": already_gone})),
                )
                .await?;
            }

            (Executed::Modified { ticket }, payload) => {
                let details = match payload {
                    OperationPayload::Modify {
                        stop_loss,
                        take_profit,
                    } => json!({"stop_loss": stop_loss, "take_profit": take_profit}),
                    _ => json!({}),
                };
                db::log_event(
                    &mut tx,
                    &self
                        .audit(AuditEvent::PositionModified, op, Some(*ticket))
                        .details(details),
                )
                .await?;
            }

            (
                Executed::PartiallyClosed {
                    ticket,
                    closed,
                    remaining_slave,
                    remaining_master,
                },
                _,
            ) => {
                db::reduce_mapping(
                    &mut tx,
                    op.master_ticket,
                    &self.name,
                    *remaining_master,
                    *remaining_slave,
                )
                .await?;
                db::log_event(
                    &mut tx,
                    &self
                        .audit(AuditEvent::PartialClose, op, Some(*ticket))
                        .details(json!({
                            "closed_volume": closed,
                            "remaining_volume": remaining_slave,
                        })),
                )
                .await?;
            }

            (Executed::Skipped(reason), _) => {
                debug!(slave = %self.name, id = op.id, reason = %reason, "Nothing to do for entry");
            }
        }

        tx.commit().await?;
        Ok(())
    }

    fn audit(&self, event: AuditEvent, op: &QueuedOperation, slave_ticket: Option<i64>) -> AuditEntry {
        AuditEntry::new(event)
            .master(op.master_ticket)
            .slave(&self.name)
            .slave_ticket(slave_ticket)
    }

    async fn settle_failure(&self, op: &QueuedOperation, error: &CopierError) -> Result<DrainOutcome> {
        let attempts = op.attempts + 1;
        let message = error.to_string();
        let mut tx = self.db.begin().await?;

        if error.is_retryable() && attempts < op.max_attempts {
            let delay = self.settings.retry_delay(attempts);
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            db::schedule_retry(&mut tx, op.id, attempts, next_retry_at, &message).await?;
            db::log_event(
                &mut tx,
                &self
                    .audit(AuditEvent::OperationRetry, op, None)
                    .details(json!({
                        "operation_id": op.id,
                        "operation": op.operation_type,
                        "attempts": attempts,
                        "error": message,
                        "retry_in_ms": delay.as_millis() as u64,
                    })),
            )
            .await?;
            tx.commit().await?;

            warn!(
                slave = %self.name,
                id = op.id,
                operation = %op.operation_type,
                master_ticket = op.master_ticket,
                attempts,
                error = %message,
                "Operation failed, will retry"
            );
            return Ok(DrainOutcome::Retrying { id: op.id, attempts });
        }

        db::fail_operation(&mut tx, op.id, attempts, &message).await?;
        abandon_operation(&mut tx, op, &self.name, attempts, &message).await?;
        tx.commit().await?;

        error!(
            slave = %self.name,
            id = op.id,
            operation = %op.operation_type,
            master_ticket = op.master_ticket,
            attempts,
            error = %message,
            "Operation failed permanently"
        );
        Ok(DrainOutcome::Failed {
            id: op.id,
            error: message,
        })
    }

    fn log_success(&self, op: &QueuedOperation, executed: &Executed) {
        match executed {
            Executed::Opened { ticket, adopted, .. } => info!(
                slave = %self.name,
                master_ticket = op.master_ticket,
                slave_ticket = ticket,
                adopted,
                "Position copied"
            ),
            Executed::Closed {
                ticket,
                already_gone,
            } => info!(
                slave = %self.name,
                master_ticket = op.master_ticket,
                slave_ticket = ticket,
                already_gone,
                "Copy closed"
            ),
            Executed::Modified { ticket } => info!(
                slave = %self.name,
                master_ticket = op.master_ticket,
                slave_ticket = ticket,
                "Stops updated"
            ),
            Executed::PartiallyClosed {
                closed,
                remaining_slave,
                ..
            } => info!(
                slave = %self.name,
                master_ticket = op.master_ticket,
                closed = %closed,
                remaining = %remaining_slave,
                "Copy partially closed"
            ),
            Executed::Skipped(_) => {}
        }
    }
}

async fn close_fully(
    connection: &dyn BrokerConnection,
    ticket: i64,
    timeout: std::time::Duration,
) -> Result<Executed> {
    match with_timeout(timeout, connection.close(ticket, None)).await {
        Ok(()) => Ok(Executed::Closed {
            ticket,
            already_gone: false,
        }),
        // Already closed on the slave (stop hit, manual close)
        Err(e) if e.is_position_not_found() => Ok(Executed::Closed {
            ticket,
            already_gone: true,
        }),
        Err(e) => Err(e.into()),
    }
}

fn slave_ticket(mapping: &PositionMapping) -> Result<i64> {
    mapping.slave_ticket.ok_or_else(|| {
        CopierError::Consistency(format!(
            "open mapping for master {} on {} has no slave ticket",
            mapping.master_ticket, mapping.slave_name
        ))
    })
}

/// Bookkeeping for an entry that just went to `failed`: its mapping moves to
/// error (a fresh error row for an open that never filled) and an
/// `operation_failed` audit row is written.
pub(super) async fn abandon_operation(
    conn: &mut SqliteConnection,
    op: &QueuedOperation,
    slave_name: &str,
    attempts: u32,
    message: &str,
) -> Result<()> {
    let fallback = failed_open_mapping(op, slave_name);
    db::mark_mapping_error(conn, op.master_ticket, slave_name, message, fallback.as_ref()).await?;
    db::log_event(
        conn,
        &AuditEntry::new(AuditEvent::OperationFailed)
            .master(op.master_ticket)
            .slave(slave_name)
            .details(json!({
                "operation_id": op.id,
                "operation": op.operation_type,
                "attempts": attempts,
                "error": message,
            })),
    )
    .await?;
    Ok(())
}

/// Error row recorded when an open fails before any position exists.
fn failed_open_mapping(op: &QueuedOperation, slave_name: &str) -> Option<NewMapping> {
    match &op.payload {
        OperationPayload::Open {
            symbol,
            direction,
            volume,
            master_volume,
            ..
        } => Some(NewMapping {
            master_ticket: op.master_ticket,
            slave_name: slave_name.to_string(),
            slave_ticket: None,
            symbol: symbol.clone(),
            master_volume: *master_volume,
            slave_volume: *volume,
            direction: *direction,
        }),
        _ => None,
    }
}
