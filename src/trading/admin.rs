//! Administrative commands and read-only queries over the engine.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::broker::{self, with_timeout, BrokerConnection};
use crate::db::{self, AuditEntry, MappingFilter, NewOperation, OperationFilter};
use crate::error::{CopierError, Result};
use crate::models::{
    AccountState, AuditEvent, AuditRecord, OperationPayload, OperationType, PositionMapping,
    PositionStats, QueueStats, QueuedOperation, SlaveConfig, SlaveUpdate,
};

use super::engine::{Engine, EngineStats};
use super::registry::SlaveAccount;
use super::worker::abandon_operation;

/// Engine overview for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub master: AccountState,
    pub slaves: usize,
    pub enabled_slaves: usize,
    pub queue: QueueStats,
    pub stats: EngineStats,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Copier Status ===")?;
        writeln!(f, "Running: {}", self.running)?;
        writeln!(
            f,
            "Master: {} ({}, balance {}, {} positions)",
            self.master.name,
            if self.master.connected { "connected" } else { "disconnected" },
            self.master.balance,
            self.master.positions_count
        )?;
        writeln!(f, "Slaves: {} ({} enabled)", self.slaves, self.enabled_slaves)?;
        writeln!(
            f,
            "Queue: {} pending, {} processing, {} completed, {} failed",
            self.queue.pending, self.queue.processing, self.queue.completed, self.queue.failed
        )?;
        writeln!(
            f,
            "Cycles: {} ({} skipped), events {}, enqueued {}",
            self.stats.cycles, self.stats.skipped_cycles, self.stats.events, self.stats.enqueued
        )?;
        Ok(())
    }
}

impl Engine {
    // ==================== Commands ====================

    /// Register a slave, connecting it from its descriptor.
    pub async fn add_slave(&self, config: SlaveConfig) -> Result<()> {
        config.validate().map_err(CopierError::InvalidConfig)?;
        let connection = broker::connect(&config.connection, self.settings.broker_timeout())?;
        self.add_slave_with_connection(config, connection).await
    }

    /// Register a slave over an existing connection.
    pub async fn add_slave_with_connection(
        &self,
        config: SlaveConfig,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<()> {
        config.validate().map_err(CopierError::InvalidConfig)?;
        let name = config.name.clone();
        let details = json!({
            "lot_mode": config.lot_mode,
            "lot_value": config.lot_value,
            "enabled": config.enabled,
            "invert_trades": config.invert_trades,
            "endpoint": config.connection.endpoint(),
        });

        {
            let _admin = self.admin_lock.lock().await;
            self.registry
                .insert_slave(SlaveAccount::new(config, Arc::clone(&connection)))
                .await?;
            self.db
                .record(AuditEntry::new(AuditEvent::SlaveAdded).slave(&name).details(details))
                .await?;
        }

        match with_timeout(self.settings.broker_timeout(), connection.snapshot()).await {
            Ok(snapshot) => {
                self.registry
                    .update_slave_state(&name, |state| state.update_from_snapshot(&snapshot))
                    .await;
            }
            Err(e) => {
                warn!(slave = %name, error = %e, "New slave not reachable yet");
                let message = e.to_string();
                self.registry
                    .update_slave_state(&name, |state| state.record_error(&message))
                    .await;
            }
        }

        self.spawn_worker(&name).await;
        info!(slave = %name, "Slave added");
        Ok(())
    }

    /// Change copy settings of a slave. Applies to entries enqueued from
    /// now on.
    pub async fn update_slave(&self, name: &str, update: SlaveUpdate) -> Result<SlaveConfig> {
        let _admin = self.admin_lock.lock().await;
        let current = self
            .registry
            .slave(name)
            .await
            .ok_or_else(|| CopierError::NotFound(format!("slave {}", name)))?;
        if update.is_empty() {
            return Ok(current.config);
        }

        let updated = update.apply_to(&current.config);
        updated.validate().map_err(CopierError::InvalidConfig)?;

        let stored = updated.clone();
        self.registry.with_slave(name, move |slave| slave.config = stored).await;
        self.db
            .record(
                AuditEntry::new(AuditEvent::SlaveUpdated)
                    .slave(name)
                    .details(serde_json::to_value(&update)?),
            )
            .await?;

        info!(slave = %name, "Slave settings updated");
        Ok(updated)
    }

    pub async fn enable(&self, name: &str) -> Result<()> {
        let _admin = self.admin_lock.lock().await;
        let slave = self
            .registry
            .slave(name)
            .await
            .ok_or_else(|| CopierError::NotFound(format!("slave {}", name)))?;
        if slave.pending_removal {
            return Err(CopierError::InvalidConfig(format!("slave {} is being removed", name)));
        }
        if slave.config.enabled {
            return Ok(());
        }

        self.registry
            .with_slave(name, |slave| {
                slave.config.enabled = true;
                slave.drain_fence = None;
            })
            .await;
        self.db
            .record(AuditEntry::new(AuditEvent::SlaveEnabled).slave(name))
            .await?;
        self.registry.wake(name).await;

        info!(slave = %name, "Slave enabled");
        Ok(())
    }

    /// Stop copying to a slave. With `close_positions`, pending opens fail,
    /// a close is queued for every copy it holds or has in flight, and the
    /// worker drains exactly the entries queued so far. Returns the number
    /// of closes queued.
    pub async fn disable(&self, name: &str, close_positions: bool) -> Result<usize> {
        let _admin = self.admin_lock.lock().await;
        if !self.registry.contains_slave(name).await {
            return Err(CopierError::NotFound(format!("slave {}", name)));
        }

        let (closes, fence) = if close_positions {
            self.fail_pending_entries(name, Some(OperationType::Open), "slave disabled")
                .await?;
            let closes = self.enqueue_slave_closes(name, "slave disabled").await?;
            (closes, Some(self.db.max_operation_id().await?))
        } else {
            (0, None)
        };

        self.registry
            .with_slave(name, |slave| {
                slave.config.enabled = false;
                slave.drain_fence = fence;
            })
            .await;
        self.db
            .record(
                AuditEntry::new(AuditEvent::SlaveDisabled)
                    .slave(name)
                    .details(json!({"close_positions": close_positions, "closes_queued": closes})),
            )
            .await?;
        self.registry.wake(name).await;

        info!(slave = %name, close_positions, closes, "Slave disabled");
        Ok(closes)
    }

    /// Take a slave out of the engine. With `close_positions`, it stays
    /// registered until the queued closes are terminal; otherwise it goes
    /// now and its pending entries fail with their mappings in error.
    pub async fn remove_slave(&self, name: &str, close_positions: bool) -> Result<usize> {
        let _admin = self.admin_lock.lock().await;
        if !self.registry.contains_slave(name).await {
            return Err(CopierError::NotFound(format!("slave {}", name)));
        }

        if close_positions {
            self.fail_pending_entries(name, Some(OperationType::Open), "slave removed")
                .await?;
            let closes = self.enqueue_slave_closes(name, "slave removed").await?;
            let fence = self.db.max_operation_id().await?;
            self.registry
                .with_slave(name, |slave| {
                    slave.config.enabled = false;
                    slave.pending_removal = true;
                    slave.drain_fence = Some(fence);
                })
                .await;
            self.registry.wake(name).await;
            info!(slave = %name, closes, "Slave removal pending until its copies are closed");
            return Ok(closes);
        }

        let failed = self.fail_pending_entries(name, None, "slave removed").await?;
        if let Some(account) = self.registry.take_slave(name).await {
            account.wakeup.notify_one();
        }
        self.db
            .record(
                AuditEntry::new(AuditEvent::SlaveRemoved)
                    .slave(name)
                    .details(json!({"closed_positions": false, "failed_entries": failed})),
            )
            .await?;

        info!(slave = %name, failed_entries = failed, "Slave removed");
        Ok(0)
    }

    /// Fail the pending entries of `name`, only opens when `only` says so.
    /// Their mappings move to error in the same transaction. An entry
    /// already in flight is left to finish.
    async fn fail_pending_entries(
        &self,
        name: &str,
        only: Option<OperationType>,
        reason: &str,
    ) -> Result<usize> {
        let mut tx = self.db.begin().await?;
        let failed = db::fail_pending(&mut tx, name, only, reason).await?;
        for op in &failed {
            abandon_operation(&mut tx, op, name, op.attempts, reason).await?;
        }
        tx.commit().await?;

        if !failed.is_empty() {
            warn!(slave = %name, failed = failed.len(), reason, "Pending entries failed");
        }
        Ok(failed.len())
    }

    /// Queue a close for every copy `name` holds or is about to hold.
    async fn enqueue_slave_closes(&self, name: &str, reason: &str) -> Result<usize> {
        let mut tickets: BTreeSet<i64> = self
            .db
            .open_mappings_for_slave(name)
            .await?
            .into_iter()
            .map(|m| m.master_ticket)
            .collect();
        tickets.extend(
            self.db
                .live_operations_for_slave(name)
                .await?
                .into_iter()
                .filter(|op| op.operation_type == OperationType::Open)
                .map(|op| op.master_ticket),
        );

        for &master_ticket in &tickets {
            self.db
                .enqueue(&NewOperation {
                    master_ticket,
                    slave_name: name.to_string(),
                    payload: OperationPayload::Close {
                        reason: reason.to_string(),
                    },
                    max_attempts: self.settings.max_attempts,
                })
                .await?;
        }
        Ok(tickets.len())
    }

    /// Reconnect the master or a slave and refresh its state.
    pub async fn reconnect(&self, name: &str) -> Result<AccountState> {
        let (role, connection) = self
            .registry
            .connection(name)
            .await
            .ok_or_else(|| CopierError::NotFound(format!("account {}", name)))?;
        let timeout = self.settings.broker_timeout();

        let refreshed = match with_timeout(timeout * 2, connection.reconnect()).await {
            Ok(()) => with_timeout(timeout, connection.snapshot()).await,
            Err(e) => Err(e),
        };

        let update = |state: &mut AccountState| match &refreshed {
            Ok(snapshot) => state.update_from_snapshot(snapshot),
            Err(e) => state.record_error(&e.to_string()),
        };
        match role {
            crate::models::AccountRole::Master => self.registry.update_master_state(update).await,
            crate::models::AccountRole::Slave => {
                self.registry.update_slave_state(name, update).await;
            }
        }

        if let Err(e) = refreshed {
            warn!(account = %name, error = %e, "Reconnect failed");
            return Err(e.into());
        }

        self.db
            .record(AuditEntry::new(AuditEvent::AccountReconnected).slave(name))
            .await?;
        self.registry.wake(name).await;
        info!(account = %name, "Account reconnected");
        self.get_account(name).await
    }

    // ==================== Queries ====================

    pub async fn status(&self) -> Result<EngineStatus> {
        let slaves = self.registry.slaves().await;
        Ok(EngineStatus {
            running: self.is_running(),
            master: self.registry.master_state().await,
            slaves: slaves.len(),
            enabled_slaves: slaves.iter().filter(|s| s.config.enabled).count(),
            queue: self.db.queue_stats().await?,
            stats: self.stats.lock().await.clone(),
        })
    }

    /// Master first, then slaves by name.
    pub async fn list_accounts(&self) -> Vec<AccountState> {
        self.registry.list().await
    }

    pub async fn get_account(&self, name: &str) -> Result<AccountState> {
        self.registry
            .get(name)
            .await
            .ok_or_else(|| CopierError::NotFound(format!("account {}", name)))
    }

    pub async fn slave_config(&self, name: &str) -> Result<SlaveConfig> {
        self.registry
            .slave(name)
            .await
            .map(|s| s.config)
            .ok_or_else(|| CopierError::NotFound(format!("slave {}", name)))
    }

    pub async fn positions(&self, filter: &MappingFilter) -> Result<Vec<PositionMapping>> {
        self.db.list_mappings(filter).await
    }

    pub async fn positions_for_master(&self, master_ticket: i64) -> Result<Vec<PositionMapping>> {
        self.db.mappings_for_master(master_ticket).await
    }

    pub async fn position_stats(&self) -> Result<PositionStats> {
        self.db.position_stats().await
    }

    pub async fn operations(&self, filter: &OperationFilter) -> Result<Vec<QueuedOperation>> {
        self.db.list_operations(filter).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.db.queue_stats().await
    }

    pub async fn audit(&self, limit: i64, event_type: Option<&str>) -> Result<Vec<AuditRecord>> {
        self.db.recent_audit(limit, event_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionDescriptor, Direction, LotMode, MappingStatus, OperationStatus};
    use crate::trading::testing::harness;
    use crate::trading::DrainOutcome;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_disable_with_close_queues_one_close_per_copy() {
        let h = harness(&["s1"]).await;
        h.engine.poll_once().await.unwrap();
        let first = h.master.place("EURUSD", Direction::Buy, dec!(1.0), Decimal::ZERO, Decimal::ZERO);
        let second = h.master.place("GBPUSD", Direction::Sell, dec!(0.5), Decimal::ZERO, Decimal::ZERO);
        h.engine.poll_once().await.unwrap();
        h.engine.drain_slave("s1").await.unwrap();
        assert_eq!(h.slave("s1").positions().len(), 2);

        let closes = h.engine.disable("s1", true).await.unwrap();
        assert_eq!(closes, 2);
        let queued = h
            .engine
            .operations(&OperationFilter {
                slave_name: Some("s1".to_string()),
                status: Some(OperationStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|op| op.operation_type == OperationType::Close));

        // New master activity after the flip is not copied
        h.master.place("USDJPY", Direction::Buy, dec!(1.0), Decimal::ZERO, Decimal::ZERO);
        let report = h.engine.poll_once().await.unwrap();
        assert_eq!(report.enqueued, 0);

        h.engine.drain_slave("s1").await.unwrap();
        assert!(h.slave("s1").positions().is_empty());
        for ticket in [first, second] {
            let mapping = h.engine.database().get_mapping(ticket, "s1").await.unwrap().unwrap();
            assert_eq!(mapping.status, MappingStatus::Closed);
        }
        assert_eq!(h.engine.registry().slave("s1").await.unwrap().drain_fence, None);
    }

    #[tokio::test]
    async fn test_disable_without_close_freezes_queue() {
        let h = harness(&["s1"]).await;
        h.engine.poll_once().await.unwrap();
        h.master.place("EURUSD", Direction::Buy, dec!(1.0), Decimal::ZERO, Decimal::ZERO);
        h.engine.poll_once().await.unwrap();

        assert_eq!(h.engine.disable("s1", false).await.unwrap(), 0);
        assert_eq!(h.engine.drain_slave_once("s1").await.unwrap(), DrainOutcome::Idle);
        assert_eq!(h.engine.queue_stats().await.unwrap().pending, 1);

        assert_ok!(h.engine.enable("s1").await);
        h.engine.drain_slave("s1").await.unwrap();
        assert_eq!(h.slave("s1").positions().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_without_close_fails_pending() {
        let h = harness(&["s1", "s2"]).await;
        h.engine.poll_once().await.unwrap();
        h.master.place("EURUSD", Direction::Buy, dec!(1.0), Decimal::ZERO, Decimal::ZERO);
        h.engine.poll_once().await.unwrap();

        assert_ok!(h.engine.remove_slave("s1", false).await);
        assert_eq!(h.engine.drain_slave_once("s1").await.unwrap(), DrainOutcome::Removed);
        let stats = h.engine.queue_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(h.engine.list_accounts().await.len(), 2);
        assert!(matches!(
            h.engine.get_account("s1").await,
            Err(CopierError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disable_with_close_fails_pending_open() {
        let h = harness(&["s1"]).await;
        h.engine.poll_once().await.unwrap();
        let ticket = h.master.place("EURUSD", Direction::Buy, dec!(1.0), Decimal::ZERO, Decimal::ZERO);
        h.engine.poll_once().await.unwrap();

        // The open never reached the slave, so there is nothing to close
        assert_eq!(h.engine.disable("s1", true).await.unwrap(), 0);
        h.engine.drain_slave("s1").await.unwrap();
        assert_eq!(h.slave("s1").orders_filled(), 0);
        assert!(h.slave("s1").positions().is_empty());

        let mapping = h.engine.database().get_mapping(ticket, "s1").await.unwrap().unwrap();
        assert_eq!(mapping.status, MappingStatus::Error);
        assert_eq!(mapping.slave_ticket, None);
        assert_eq!(mapping.last_error.as_deref(), Some("slave disabled"));
        let stats = h.engine.queue_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(
            h.engine.database().count_audit(AuditEvent::OperationFailed).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_remove_without_close_moves_mappings_to_error() {
        let h = harness(&["s1"]).await;
        h.engine.poll_once().await.unwrap();
        let first = h.master.place("EURUSD", Direction::Buy, dec!(1.0), Decimal::ZERO, Decimal::ZERO);
        h.engine.poll_once().await.unwrap();
        h.engine.drain_slave("s1").await.unwrap();

        h.master.remove(first);
        let second = h.master.place("GBPUSD", Direction::Sell, dec!(0.5), Decimal::ZERO, Decimal::ZERO);
        let report = h.engine.poll_once().await.unwrap();
        assert_eq!(report.enqueued, 2);

        assert_ok!(h.engine.remove_slave("s1", false).await);
        assert_eq!(h.engine.queue_stats().await.unwrap().failed, 2);

        let closed_on_master = h.engine.database().get_mapping(first, "s1").await.unwrap().unwrap();
        assert_eq!(closed_on_master.status, MappingStatus::Error);
        assert_eq!(closed_on_master.last_error.as_deref(), Some("slave removed"));
        let never_opened = h.engine.database().get_mapping(second, "s1").await.unwrap().unwrap();
        assert_eq!(never_opened.status, MappingStatus::Error);
        assert_eq!(never_opened.slave_ticket, None);
        assert_eq!(
            h.engine.database().count_audit(AuditEvent::OperationFailed).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_remove_with_close_waits_for_closes() {
        let h = harness(&["s1"]).await;
        h.engine.poll_once().await.unwrap();
        let ticket = h.master.place("EURUSD", Direction::Buy, dec!(1.0), Decimal::ZERO, Decimal::ZERO);
        h.engine.poll_once().await.unwrap();
        h.engine.drain_slave("s1").await.unwrap();

        assert_eq!(h.engine.remove_slave("s1", true).await.unwrap(), 1);
        assert!(h.engine.registry().contains_slave("s1").await);
        assert_err!(h.engine.enable("s1").await);

        let outcomes = h.engine.drain_slave("s1").await.unwrap();
        assert_eq!(outcomes.last(), Some(&DrainOutcome::Removed));
        assert!(!h.engine.registry().contains_slave("s1").await);
        assert!(h.slave("s1").positions().is_empty());

        let mapping = h.engine.database().get_mapping(ticket, "s1").await.unwrap().unwrap();
        assert_eq!(mapping.status, MappingStatus::Closed);
        assert_eq!(
            h.engine.database().count_audit(AuditEvent::SlaveRemoved).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_add_and_update_slave() {
        let h = harness(&[]).await;
        let mut config = SlaveConfig::new("paper", ConnectionDescriptor::default());
        config.max_lot = Decimal::ZERO;
        assert!(matches!(
            h.engine.add_slave(config.clone()).await,
            Err(CopierError::InvalidConfig(_))
        ));

        config.max_lot = dec!(5);
        assert_ok!(h.engine.add_slave(config.clone()).await);
        assert!(matches!(
            h.engine.add_slave(config).await,
            Err(CopierError::AlreadyExists(_))
        ));
        let state = h.engine.get_account("paper").await.unwrap();
        assert_eq!(state.balance, dec!(10000));

        let updated = h
            .engine
            .update_slave(
                "paper",
                SlaveUpdate {
                    lot_mode: Some(LotMode::Multiplier),
                    lot_value: Some(dec!(3)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.lot_mode, LotMode::Multiplier);
        assert_eq!(h.engine.slave_config("paper").await.unwrap().lot_value, dec!(3));

        let bad = SlaveUpdate {
            min_lot: Some(dec!(10)),
            ..Default::default()
        };
        assert!(matches!(
            h.engine.update_slave("paper", bad).await,
            Err(CopierError::InvalidConfig(_))
        ));
        assert!(matches!(
            h.engine.update_slave("ghost", SlaveUpdate::default()).await,
            Err(CopierError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_refreshes_state() {
        let h = harness(&["s1"]).await;
        h.slave("s1").set_connected(false);

        let state = h.engine.reconnect("s1").await.unwrap();
        assert!(state.connected);
        assert!(matches!(
            h.engine.reconnect("nobody").await,
            Err(CopierError::NotFound(_))
        ));

        let master = h.engine.reconnect("master").await.unwrap();
        assert!(master.connected);
        assert_eq!(
            h.engine.database().count_audit(AuditEvent::AccountReconnected).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_queries() {
        let h = harness(&["s1", "s2"]).await;
        h.engine.poll_once().await.unwrap();
        let ticket = h.master.place("EURUSD", Direction::Buy, dec!(1.0), Decimal::ZERO, Decimal::ZERO);
        h.engine.poll_once().await.unwrap();
        h.engine.drain_slave("s1").await.unwrap();
        h.engine.drain_slave("s2").await.unwrap();

        assert_eq!(h.engine.positions_for_master(ticket).await.unwrap().len(), 2);
        let open = h
            .engine
            .positions(&MappingFilter {
                slave_name: Some("s2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(open.len(), 1);

        let stats = h.engine.position_stats().await.unwrap();
        assert_eq!(stats.total_master_positions, 1);
        assert_eq!(stats.total_slave_positions, 2);

        let audit = h.engine.audit(10, Some("position_opened")).await.unwrap();
        assert_eq!(audit.len(), 2);

        let status = h.engine.status().await.unwrap();
        assert_eq!(status.slaves, 2);
        assert_eq!(status.queue.completed, 2);
        assert!(status.to_string().contains("=== Copier Status ==="));
    }
}
