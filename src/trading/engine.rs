//! Replication engine: polls the master, turns position changes into queue
//! entries for every affected slave, and runs the per-slave drain workers.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{with_timeout, BrokerConnection};
use crate::db::{self, AuditEntry, Database, EnqueueOutcome, NewMapping, NewOperation};
use crate::error::{Result, SizingError};
use crate::models::{
    order_comment, AccountSnapshot, AuditEvent, Direction, LotMode, MasterConfig,
    OperationPayload, OperationType, PositionSnapshot,
};

use super::detector::{ChangeDetector, ChangeSet, PartialClose};
use super::lot_sizer::{compute_slave_volume, raw_volume};
use super::registry::{AccountRegistry, SlaveView};
use super::worker::{DrainOutcome, FatalSlot, SlaveWorker};
use super::EngineSettings;

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// The master could not be read; nothing else happened
    pub skipped: bool,
    /// First successful poll after start
    pub baseline: bool,
    pub events: usize,
    /// New queue entries
    pub enqueued: usize,
    /// Already queued, or a pending modify refreshed
    pub deduplicated: usize,
    /// Entries written as failed at enqueue time
    pub rejected: usize,
    /// Opens dropped because sizing gave zero volume
    pub sizing_skipped: usize,
    /// Closes added for mappings whose master position vanished while offline
    pub reconciled: usize,
}

impl CycleReport {
    fn count(&mut self, outcome: EnqueueOutcome) {
        if outcome.is_new() {
            self.enqueued += 1;
        } else {
            self.deduplicated += 1;
        }
    }
}

/// Running totals since start.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub cycles: u64,
    pub skipped_cycles: u64,
    pub events: u64,
    pub enqueued: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl EngineStats {
    fn absorb(&mut self, report: &CycleReport) {
        self.cycles += 1;
        if report.skipped {
            self.skipped_cycles += 1;
        }
        self.events += report.events as u64;
        self.enqueued += report.enqueued as u64;
        self.last_poll_at = Some(Utc::now());
    }
}

/// The replication engine.
pub struct Engine {
    pub(super) settings: EngineSettings,
    pub(super) db: Database,
    pub(super) registry: Arc<AccountRegistry>,
    detector: Mutex<ChangeDetector>,
    /// Serializes enqueue decisions against enable/disable/add/remove
    pub(super) admin_lock: Mutex<()>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    fatal: FatalSlot,
    started: AtomicBool,
    pub(super) stats: Mutex<EngineStats>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        db: Database,
        master: MasterConfig,
        master_connection: Arc<dyn BrokerConnection>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            settings,
            db,
            registry: Arc::new(AccountRegistry::new(master, master_connection)),
            detector: Mutex::new(ChangeDetector::new()),
            admin_lock: Mutex::new(()),
            workers: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            shutdown_tx: Arc::new(shutdown_tx),
            fatal: Arc::new(Mutex::new(None)),
            started: AtomicBool::new(false),
            stats: Mutex::new(EngineStats::default()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> Arc<AccountRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !*self.shutdown_tx.borrow()
    }

    // ==================== Lifecycle ====================

    /// Recover interrupted entries, refresh account state, and spawn the
    /// drain workers and heartbeat task.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let recovered = self.db.recover_interrupted().await?;
        for op in &recovered {
            warn!(
                id = op.id,
                slave = %op.slave_name,
                operation = %op.operation_type,
                master_ticket = op.master_ticket,
                "Recovered entry interrupted by previous run"
            );
            self.db
                .record(
                    AuditEntry::new(AuditEvent::OperationRecovered)
                        .master(op.master_ticket)
                        .slave(&op.slave_name)
                        .details(json!({"operation_id": op.id, "operation": op.operation_type})),
                )
                .await?;
        }

        heartbeat_accounts(&self.registry, &self.settings).await;

        for name in self.registry.slave_names().await {
            self.spawn_worker(&name).await;
        }

        let registry = Arc::clone(&self.registry);
        let settings = self.settings.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(settings.heartbeat_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => heartbeat_accounts(&registry, &settings).await,
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.heartbeat.lock().await = Some(handle);

        self.stats.lock().await.started_at = Some(Utc::now());
        let slave_count = self.registry.slave_names().await.len();
        info!(
            slaves = slave_count,
            recovered = recovered.len(),
            poll_interval_ms = self.settings.poll_interval_ms,
            "Replication engine started"
        );
        Ok(())
    }

    /// Start, then poll the master until shutdown. Returns the storage
    /// error that stopped the engine, if any.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        if e.is_fatal() {
                            error!(error = %e, "Storage failure in poll cycle, stopping engine");
                            break Err(e);
                        }
                        error!(error = %e, "Error in poll cycle");
                    }
                }
                _ = shutdown.changed() => {
                    break Ok(());
                }
            }
        };

        self.stop().await;

        match self.fatal.lock().await.take() {
            Some(e) => Err(e),
            None => outcome,
        }
    }

    /// Ask the poll loop and workers to stop.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    /// Signal shutdown and wait for every task to finish its current entry.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let workers: Vec<(String, JoinHandle<()>)> = self.workers.lock().await.drain().collect();
        for (name, handle) in workers {
            if let Err(e) = handle.await {
                warn!(slave = %name, error = %e, "Drain worker ended abnormally");
            }
        }
        if let Some(handle) = self.heartbeat.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Heartbeat task ended abnormally");
            }
        }
        info!("Replication engine stopped");
    }

    pub(super) async fn spawn_worker(&self, name: &str) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get(name) {
            if !existing.is_finished() {
                return;
            }
        }

        let worker = SlaveWorker::new(
            name.to_string(),
            self.db.clone(),
            Arc::clone(&self.registry),
            self.settings.clone(),
        );
        let handle = tokio::spawn(worker.run(
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.shutdown_tx),
            Arc::clone(&self.fatal),
        ));
        workers.insert(name.to_string(), handle);
    }

    /// Drain at most one entry for `slave` on the caller's task.
    pub async fn drain_slave_once(&self, slave: &str) -> Result<DrainOutcome> {
        SlaveWorker::new(
            slave.to_string(),
            self.db.clone(),
            Arc::clone(&self.registry),
            self.settings.clone(),
        )
        .drain_once()
        .await
    }

    /// Drain `slave` until nothing is claimable. Entries backing off for a
    /// retry are left pending.
    pub async fn drain_slave(&self, slave: &str) -> Result<Vec<DrainOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            match self.drain_slave_once(slave).await? {
                DrainOutcome::Idle => break,
                DrainOutcome::Removed => {
                    outcomes.push(DrainOutcome::Removed);
                    break;
                }
                outcome => outcomes.push(outcome),
            }
        }
        Ok(outcomes)
    }

    // ==================== Heartbeat ====================

    /// Refresh every account now.
    pub async fn heartbeat_once(&self) {
        heartbeat_accounts(&self.registry, &self.settings).await;
    }

    // ==================== Poll cycle ====================

    /// Read the master, diff against the previous snapshot and enqueue the
    /// resulting work. A failed read skips the cycle.
    pub async fn poll_once(&self) -> Result<CycleReport> {
        let master = self.registry.master_connection().await;
        let snapshot = match with_timeout(self.settings.broker_timeout(), master.snapshot()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Master poll failed, skipping cycle");
                let message = e.to_string();
                self.registry
                    .update_master_state(|state| state.record_error(&message))
                    .await;
                let report = CycleReport {
                    skipped: true,
                    ..Default::default()
                };
                self.stats.lock().await.absorb(&report);
                return Ok(report);
            }
        };

        self.registry
            .update_master_state(|state| state.update_from_snapshot(&snapshot))
            .await;

        let (baseline, changes) = {
            let mut detector = self.detector.lock().await;
            let baseline = detector.is_baseline();
            let changes = detector.observe(&snapshot.positions, self.settings.copy_existing_on_startup);
            (baseline, changes)
        };

        let mut report = CycleReport {
            baseline,
            events: changes.event_count(),
            ..Default::default()
        };

        if baseline {
            self.reconcile_on_startup(&snapshot, &mut report).await?;
        }
        if !changes.is_empty() {
            debug!(
                opened = changes.opened.len(),
                closed = changes.closed.len(),
                modified = changes.modified.len(),
                partial = changes.partial_closed.len(),
                "Master changes detected"
            );
            self.apply_changes(&changes, &snapshot, &mut report).await?;
        }

        self.stats.lock().await.absorb(&report);
        Ok(report)
    }

    /// Turn a change set into queue entries.
    pub async fn apply_changes(
        &self,
        changes: &ChangeSet,
        master: &AccountSnapshot,
        report: &mut CycleReport,
    ) -> Result<()> {
        let _admin = self.admin_lock.lock().await;

        for position in &changes.opened {
            self.handle_opened(position, master.balance, report).await?;
        }
        for partial in &changes.partial_closed {
            self.handle_partial_close(partial, report).await?;
        }
        for position in &changes.modified {
            self.handle_modified(position, report).await?;
        }
        for position in &changes.closed {
            self.handle_closed(position.ticket, "master closed", report).await?;
        }
        for increase in &changes.volume_increased {
            warn!(
                master_ticket = increase.position.ticket,
                previous = %increase.previous_volume,
                current = %increase.position.volume,
                "Master volume increased, not replicated"
            );
            self.db
                .record(
                    AuditEntry::new(AuditEvent::VolumeIncreaseIgnored)
                        .master(increase.position.ticket)
                        .details(json!({
                            "symbol": increase.position.symbol,
                            "previous_volume": increase.previous_volume,
                            "current_volume": increase.position.volume,
                        })),
                )
                .await?;
        }

        if report.enqueued > 0 {
            self.registry.wake_all().await;
        }
        Ok(())
    }

    async fn handle_opened(
        &self,
        position: &PositionSnapshot,
        master_balance: Decimal,
        report: &mut CycleReport,
    ) -> Result<()> {
        for slave in self.registry.copy_targets(&position.symbol).await {
            let name = slave.config.name.as_str();
            if self.db.get_mapping(position.ticket, name).await?.is_some() {
                continue;
            }

            let step = slave
                .state
                .lot_step(&position.symbol, self.settings.default_lot_step);
            let balance = known_balance(&slave);
            let deferred = balance.is_none();
            let sized = match balance {
                Some(balance) => compute_slave_volume(
                    position.volume,
                    master_balance,
                    balance,
                    &slave.config,
                    step,
                ),
                // Sized by the worker once the slave reports a balance
                None => raw_volume(position.volume, master_balance, Decimal::ZERO, &slave.config)
                    .map(|_| Decimal::ZERO),
            };

            let direction = if slave.config.invert_trades {
                position.direction.opposite()
            } else {
                position.direction
            };
            let (stop_loss, take_profit) = slave_stops(&slave, position.stop_loss, position.take_profit);

            match sized {
                Ok(volume) => {
                    let op = NewOperation {
                        master_ticket: position.ticket,
                        slave_name: name.to_string(),
                        payload: OperationPayload::Open {
                            symbol: position.symbol.clone(),
                            direction,
                            volume,
                            master_volume: position.volume,
                            stop_loss,
                            take_profit,
                            magic: slave.config.magic_number,
                            slippage: slave.config.max_slippage,
                            comment: order_comment(position.ticket),
                            request_id: Uuid::new_v4().to_string(),
                            master_balance: deferred.then_some(master_balance),
                        },
                        max_attempts: self.settings.max_attempts,
                    };
                    let outcome = self.db.enqueue(&op).await?;
                    report.count(outcome);
                    info!(
                        slave = %name,
                        master_ticket = position.ticket,
                        symbol = %position.symbol,
                        direction = %direction,
                        volume = %volume,
                        deferred,
                        new = outcome.is_new(),
                        "Open queued"
                    );
                }
                Err(SizingError::ZeroVolume) => {
                    report.sizing_skipped += 1;
                    info!(
                        slave = %name,
                        master_ticket = position.ticket,
                        master_volume = %position.volume,
                        "Sized to zero volume, not copying"
                    );
                    self.db
                        .record(
                            AuditEntry::new(AuditEvent::SizingSkipped)
                                .master(position.ticket)
                                .slave(name)
                                .details(json!({
                                    "symbol": position.symbol,
                                    "master_volume": position.volume,
                                    "lot_mode": slave.config.lot_mode,
                                })),
                        )
                        .await?;
                }
                Err(e) => {
                    report.rejected += 1;
                    self.reject_open(position, &slave, direction, &e).await?;
                }
            }
        }
        Ok(())
    }

    /// Sizing failure at enqueue time: a terminal entry plus an error
    /// mapping, so the failure shows up in queue and positions views.
    async fn reject_open(
        &self,
        position: &PositionSnapshot,
        slave: &SlaveView,
        direction: Direction,
        error: &SizingError,
    ) -> Result<()> {
        let name = slave.config.name.as_str();
        let message = error.to_string();
        let (stop_loss, take_profit) = slave_stops(slave, position.stop_loss, position.take_profit);
        let op = NewOperation {
            master_ticket: position.ticket,
            slave_name: name.to_string(),
            payload: OperationPayload::Open {
                symbol: position.symbol.clone(),
                direction,
                volume: Decimal::ZERO,
                master_volume: position.volume,
                stop_loss,
                take_profit,
                magic: slave.config.magic_number,
                slippage: slave.config.max_slippage,
                comment: order_comment(position.ticket),
                request_id: Uuid::new_v4().to_string(),
                master_balance: None,
            },
            max_attempts: self.settings.max_attempts,
        };

        let mut tx = self.db.begin().await?;
        let id = self.db.insert_failed(&mut tx, &op, &message).await?;
        db::mark_mapping_error(
            &mut tx,
            position.ticket,
            name,
            &message,
            Some(&NewMapping {
                master_ticket: position.ticket,
                slave_name: name.to_string(),
                slave_ticket: None,
                symbol: position.symbol.clone(),
                master_volume: position.volume,
                slave_volume: Decimal::ZERO,
                direction,
            }),
        )
        .await?;
        db::log_event(
            &mut tx,
            &AuditEntry::new(AuditEvent::OperationFailed)
                .master(position.ticket)
                .slave(name)
                .details(json!({"operation_id": id, "operation": OperationType::Open, "error": message})),
        )
        .await?;
        tx.commit().await?;

        error!(slave = %name, master_ticket = position.ticket, error = %message, "Cannot size copy");
        Ok(())
    }

    /// Registered slaves holding an open copy of `master_ticket` or a live
    /// open for it. Disabled slaves are included so they catch up when
    /// re-enabled; slaves being removed are not.
    async fn holders(&self, master_ticket: i64) -> Result<Vec<SlaveView>> {
        let mut names: BTreeSet<String> = self
            .db
            .mappings_for_master(master_ticket)
            .await?
            .into_iter()
            .filter(|m| m.is_open())
            .map(|m| m.slave_name)
            .collect();
        names.extend(
            self.db
                .live_operations_for_ticket(master_ticket)
                .await?
                .into_iter()
                .filter(|op| op.operation_type == OperationType::Open)
                .map(|op| op.slave_name),
        );

        let mut holders = Vec::new();
        for name in names {
            if let Some(slave) = self.registry.slave(&name).await {
                if !slave.pending_removal {
                    holders.push(slave);
                }
            }
        }
        Ok(holders)
    }

    async fn handle_closed(&self, master_ticket: i64, reason: &str, report: &mut CycleReport) -> Result<()> {
        for slave in self.holders(master_ticket).await? {
            let outcome = self
                .db
                .enqueue(&NewOperation {
                    master_ticket,
                    slave_name: slave.config.name.clone(),
                    payload: OperationPayload::Close {
                        reason: reason.to_string(),
                    },
                    max_attempts: self.settings.max_attempts,
                })
                .await?;
            report.count(outcome);
            info!(slave = %slave.config.name, master_ticket, reason, "Close queued");
        }
        Ok(())
    }

    async fn handle_partial_close(&self, partial: &PartialClose, report: &mut CycleReport) -> Result<()> {
        let ticket = partial.position.ticket;
        for slave in self.holders(ticket).await? {
            let payload = if slave.config.lot_mode.scales_with_master() {
                OperationPayload::PartialClose {
                    closed_volume: partial.closed_volume(),
                    original_volume: partial.previous_volume,
                }
            } else {
                OperationPayload::Close {
                    reason: "master partial close on fixed lot copy".to_string(),
                }
            };
            let kind = payload.operation_type();
            let outcome = self
                .db
                .enqueue(&NewOperation {
                    master_ticket: ticket,
                    slave_name: slave.config.name.clone(),
                    payload,
                    max_attempts: self.settings.max_attempts,
                })
                .await?;
            report.count(outcome);
            info!(
                slave = %slave.config.name,
                master_ticket = ticket,
                closed = %partial.closed_volume(),
                operation = %kind,
                "Partial close queued"
            );
        }
        Ok(())
    }

    async fn handle_modified(&self, position: &PositionSnapshot, report: &mut CycleReport) -> Result<()> {
        for slave in self.holders(position.ticket).await? {
            let (stop_loss, take_profit) = slave_stops(&slave, position.stop_loss, position.take_profit);
            let outcome = self
                .db
                .enqueue(&NewOperation {
                    master_ticket: position.ticket,
                    slave_name: slave.config.name.clone(),
                    payload: OperationPayload::Modify {
                        stop_loss,
                        take_profit,
                    },
                    max_attempts: self.settings.max_attempts,
                })
                .await?;
            report.count(outcome);
            debug!(
                slave = %slave.config.name,
                master_ticket = position.ticket,
                stop_loss = %stop_loss,
                take_profit = %take_profit,
                "Modify queued"
            );
        }
        Ok(())
    }

    /// On the first poll, close copies whose master position disappeared
    /// while the engine was down.
    async fn reconcile_on_startup(&self, snapshot: &AccountSnapshot, report: &mut CycleReport) -> Result<()> {
        let alive: BTreeSet<i64> = snapshot.positions.iter().map(|p| p.ticket).collect();
        let mut vanished: BTreeSet<i64> = self
            .db
            .open_mappings()
            .await?
            .into_iter()
            .map(|m| m.master_ticket)
            .filter(|ticket| !alive.contains(ticket))
            .collect();

        for slave in self.registry.slave_names().await {
            for op in self.db.live_operations_for_slave(&slave).await? {
                if op.operation_type == OperationType::Open && !alive.contains(&op.master_ticket) {
                    vanished.insert(op.master_ticket);
                }
            }
        }

        if vanished.is_empty() {
            return Ok(());
        }

        let _admin = self.admin_lock.lock().await;
        for ticket in vanished {
            let before = report.enqueued;
            self.handle_closed(ticket, "closed while engine was offline", report)
                .await?;
            let added = report.enqueued - before;
            report.reconciled += added;

            if added > 0 {
                warn!(master_ticket = ticket, closes = added, "Master position gone since last run, closing copies");
                self.db
                    .record(
                        AuditEntry::new(AuditEvent::StartupReconciled)
                            .master(ticket)
                            .details(json!({"closes_queued": added})),
                    )
                    .await?;
            }
        }
        self.registry.wake_all().await;
        Ok(())
    }
}

/// Balance for proportional sizing, `None` while the slave has never
/// reported one. Never calls the broker.
fn known_balance(slave: &SlaveView) -> Option<Decimal> {
    if slave.config.lot_mode == LotMode::Proportional && slave.state.last_heartbeat.is_none() {
        return None;
    }
    Some(slave.state.balance)
}

/// Stops for a slave order; inverted copies trade the other side, so the
/// master's stop loss becomes their take profit and vice versa.
fn slave_stops(slave: &SlaveView, stop_loss: Decimal, take_profit: Decimal) -> (Decimal, Decimal) {
    if slave.config.invert_trades {
        (take_profit, stop_loss)
    } else {
        (stop_loss, take_profit)
    }
}

/// Snapshot every account concurrently, refresh its state, and reconnect
/// the ones that dropped when configured to.
async fn heartbeat_accounts(registry: &AccountRegistry, settings: &EngineSettings) {
    let timeout = settings.broker_timeout();
    let master_name = registry.master_name().await;
    let master = registry.master_connection().await;
    let slaves = registry.slaves().await;

    let mut targets: Vec<(String, bool, Arc<dyn BrokerConnection>)> =
        vec![(master_name, true, master)];
    targets.extend(
        slaves
            .into_iter()
            .map(|s| (s.config.name.clone(), false, s.connection)),
    );

    let checks = targets.into_iter().map(|(name, is_master, connection)| async move {
        // A link the connection already reports as down is restored first
        let mut reconnected = false;
        if settings.auto_reconnect && !connection.is_connected().await {
            info!(account = %name, "Account disconnected, reconnecting");
            reconnected = try_reconnect(&name, connection.as_ref(), timeout).await;
        }

        let mut result = with_timeout(timeout, connection.snapshot()).await;
        if result.is_err() && settings.auto_reconnect && !reconnected {
            info!(account = %name, "Account unreachable, reconnecting");
            if try_reconnect(&name, connection.as_ref(), timeout).await {
                result = with_timeout(timeout, connection.snapshot()).await;
            }
        }
        (name, is_master, result)
    });

    for (name, is_master, result) in join_all(checks).await {
        let update = |state: &mut crate::models::AccountState| match &result {
            Ok(snapshot) => state.update_from_snapshot(snapshot),
            Err(e) => state.record_error(&e.to_string()),
        };
        if is_master {
            registry.update_master_state(update).await;
        } else {
            registry.update_slave_state(&name, update).await;
        }
        if let Err(e) = &result {
            warn!(account = %name, error = %e, "Heartbeat failed");
        }
    }
}

async fn try_reconnect(
    name: &str,
    connection: &dyn BrokerConnection,
    timeout: std::time::Duration,
) -> bool {
    match with_timeout(timeout * 2, connection.reconnect()).await {
        Ok(()) => true,
        Err(e) => {
            warn!(account = %name, error = %e, "Reconnect failed");
            false
        }
    }
}
