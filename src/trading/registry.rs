//! Account registry: the master and every slave with its connection,
//! configuration and runtime state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};

use crate::broker::BrokerConnection;
use crate::error::{CopierError, Result};
use crate::models::{AccountRole, AccountState, MasterConfig, SlaveConfig};

/// The copy source.
pub struct MasterAccount {
    pub config: MasterConfig,
    pub connection: Arc<dyn BrokerConnection>,
    pub state: AccountState,
}

/// A copy target and its drain bookkeeping.
pub struct SlaveAccount {
    pub config: SlaveConfig,
    pub connection: Arc<dyn BrokerConnection>,
    pub state: AccountState,
    /// Highest queue id the worker may still claim while disabled
    pub drain_fence: Option<i64>,
    /// Leaves the registry once the fenced entries are terminal
    pub pending_removal: bool,
    pub wakeup: Arc<Notify>,
}

impl SlaveAccount {
    pub fn new(config: SlaveConfig, connection: Arc<dyn BrokerConnection>) -> Self {
        let state = AccountState::new(config.name.clone(), AccountRole::Slave);
        Self {
            config,
            connection,
            state,
            drain_fence: None,
            pending_removal: false,
            wakeup: Arc::new(Notify::new()),
        }
    }

    fn view(&self) -> SlaveView {
        SlaveView {
            config: self.config.clone(),
            state: self.state.clone(),
            connection: Arc::clone(&self.connection),
            drain_fence: self.drain_fence,
            pending_removal: self.pending_removal,
        }
    }

    fn drain_gate(&self) -> DrainGate {
        if self.config.enabled && !self.pending_removal {
            DrainGate::Open
        } else {
            match self.drain_fence {
                Some(fence) => DrainGate::Fenced(fence),
                None => DrainGate::Closed,
            }
        }
    }
}

/// Point-in-time copy of a slave entry.
#[derive(Clone)]
pub struct SlaveView {
    pub config: SlaveConfig,
    pub state: AccountState,
    pub connection: Arc<dyn BrokerConnection>,
    pub drain_fence: Option<i64>,
    pub pending_removal: bool,
}

/// Which queue entries a slave worker may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainGate {
    /// Enabled: anything due
    Open,
    /// Disabled with work left: only ids up to the fence
    Fenced(i64),
    /// Disabled or unknown: nothing
    Closed,
}

/// Explicit handle to every account the engine drives.
pub struct AccountRegistry {
    master: RwLock<MasterAccount>,
    slaves: RwLock<HashMap<String, SlaveAccount>>,
}

impl AccountRegistry {
    pub fn new(config: MasterConfig, connection: Arc<dyn BrokerConnection>) -> Self {
        let state = AccountState::new(config.name.clone(), AccountRole::Master);
        Self {
            master: RwLock::new(MasterAccount {
                config,
                connection,
                state,
            }),
            slaves: RwLock::new(HashMap::new()),
        }
    }

    // ==================== Master ====================

    pub async fn master_name(&self) -> String {
        self.master.read().await.config.name.clone()
    }

    pub async fn master_connection(&self) -> Arc<dyn BrokerConnection> {
        Arc::clone(&self.master.read().await.connection)
    }

    pub async fn master_state(&self) -> AccountState {
        self.master.read().await.state.clone()
    }

    pub async fn update_master_state<F>(&self, f: F)
    where
        F: FnOnce(&mut AccountState),
    {
        f(&mut self.master.write().await.state);
    }

    // ==================== Slaves ====================

    pub async fn insert_slave(&self, account: SlaveAccount) -> Result<()> {
        let name = account.config.name.clone();
        if self.master.read().await.config.name == name {
            return Err(CopierError::AlreadyExists(format!(
                "{} is the master account",
                name
            )));
        }

        let mut slaves = self.slaves.write().await;
        if slaves.contains_key(&name) {
            return Err(CopierError::AlreadyExists(format!("slave {}", name)));
        }
        slaves.insert(name, account);
        Ok(())
    }

    pub async fn take_slave(&self, name: &str) -> Option<SlaveAccount> {
        self.slaves.write().await.remove(name)
    }

    pub async fn contains_slave(&self, name: &str) -> bool {
        self.slaves.read().await.contains_key(name)
    }

    pub async fn slave_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slaves.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn slave(&self, name: &str) -> Option<SlaveView> {
        self.slaves.read().await.get(name).map(SlaveAccount::view)
    }

    /// Every registered slave, sorted by name.
    pub async fn slaves(&self) -> Vec<SlaveView> {
        let slaves = self.slaves.read().await;
        let mut views: Vec<SlaveView> = slaves.values().map(SlaveAccount::view).collect();
        views.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        views
    }

    /// Enabled slaves whose filter admits `symbol`.
    pub async fn copy_targets(&self, symbol: &str) -> Vec<SlaveView> {
        let slaves = self.slaves.read().await;
        let mut targets: Vec<SlaveView> = slaves
            .values()
            .filter(|s| {
                s.config.enabled && !s.pending_removal && s.config.symbols_filter.admits(symbol)
            })
            .map(SlaveAccount::view)
            .collect();
        targets.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        targets
    }

    pub async fn drain_gate(&self, name: &str) -> DrainGate {
        self.slaves
            .read()
            .await
            .get(name)
            .map(SlaveAccount::drain_gate)
            .unwrap_or(DrainGate::Closed)
    }

    /// Run `f` against a slave entry under the write lock.
    pub async fn with_slave<F, R>(&self, name: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut SlaveAccount) -> R,
    {
        self.slaves.write().await.get_mut(name).map(f)
    }

    pub async fn update_slave_state<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut AccountState),
    {
        self.with_slave(name, |slave| f(&mut slave.state)).await.is_some()
    }

    pub async fn wake(&self, name: &str) {
        if let Some(slave) = self.slaves.read().await.get(name) {
            slave.wakeup.notify_one();
        }
    }

    pub async fn wake_all(&self) {
        for slave in self.slaves.read().await.values() {
            slave.wakeup.notify_one();
        }
    }

    pub async fn wakeup_handle(&self, name: &str) -> Option<Arc<Notify>> {
        self.slaves
            .read()
            .await
            .get(name)
            .map(|slave| Arc::clone(&slave.wakeup))
    }

    // ==================== Lookup ====================

    /// Master first, then slaves by name.
    pub async fn list(&self) -> Vec<AccountState> {
        let mut accounts = vec![self.master_state().await];
        accounts.extend(self.slaves().await.into_iter().map(|s| s.state));
        accounts
    }

    pub async fn get(&self, name: &str) -> Option<AccountState> {
        {
            let master = self.master.read().await;
            if master.config.name == name {
                return Some(master.state.clone());
            }
        }
        self.slaves.read().await.get(name).map(|s| s.state.clone())
    }

    /// Connection of any account by name.
    pub async fn connection(&self, name: &str) -> Option<(AccountRole, Arc<dyn BrokerConnection>)> {
        {
            let master = self.master.read().await;
            if master.config.name == name {
                return Some((AccountRole::Master, Arc::clone(&master.connection)));
            }
        }
        self.slaves
            .read()
            .await
            .get(name)
            .map(|s| (AccountRole::Slave, Arc::clone(&s.connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::models::{ConnectionDescriptor, SymbolFilter};
    use rust_decimal_macros::dec;

    fn paper() -> Arc<dyn BrokerConnection> {
        Arc::new(PaperBroker::new(dec!(1000)))
    }

    fn slave(name: &str) -> SlaveAccount {
        SlaveAccount::new(SlaveConfig::new(name, ConnectionDescriptor::default()), paper())
    }

    #[tokio::test]
    async fn test_copy_targets_respect_enabled_and_filter() {
        let registry = AccountRegistry::new(MasterConfig::default(), paper());
        registry.insert_slave(slave("a")).await.unwrap();

        let mut filtered = slave("b");
        filtered.config.symbols_filter = SymbolFilter::from(Some(vec!["XAUUSD".to_string()]));
        registry.insert_slave(filtered).await.unwrap();

        let mut disabled = slave("c");
        disabled.config.enabled = false;
        registry.insert_slave(disabled).await.unwrap();

        let names = |views: Vec<SlaveView>| views.into_iter().map(|v| v.config.name).collect::<Vec<_>>();
        assert_eq!(names(registry.copy_targets("EURUSD").await), vec!["a"]);
        assert_eq!(names(registry.copy_targets("XAUUSD").await), vec!["a", "b"]);
        assert_eq!(registry.list().await.len(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let registry = AccountRegistry::new(MasterConfig::default(), paper());
        registry.insert_slave(slave("a")).await.unwrap();
        assert!(matches!(
            registry.insert_slave(slave("a")).await,
            Err(CopierError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.insert_slave(slave("master")).await,
            Err(CopierError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_drain_gate() {
        let registry = AccountRegistry::new(MasterConfig::default(), paper());
        registry.insert_slave(slave("a")).await.unwrap();
        assert_eq!(registry.drain_gate("a").await, DrainGate::Open);
        assert_eq!(registry.drain_gate("ghost").await, DrainGate::Closed);

        registry
            .with_slave("a", |s| {
                s.config.enabled = false;
                s.drain_fence = Some(12);
            })
            .await;
        assert_eq!(registry.drain_gate("a").await, DrainGate::Fenced(12));

        registry.with_slave("a", |s| s.drain_fence = None).await;
        assert_eq!(registry.drain_gate("a").await, DrainGate::Closed);
    }
}
