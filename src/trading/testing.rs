//! Engine fixtures over paper brokers and in-memory SQLite.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rust_decimal_macros::dec;

use crate::broker::{BrokerConnection, PaperBroker};
use crate::db::Database;
use crate::models::{ConnectionDescriptor, MasterConfig, SlaveConfig};

use super::{Engine, EngineSettings};

pub(crate) struct Harness {
    pub engine: Engine,
    pub master: Arc<PaperBroker>,
    slaves: Mutex<HashMap<String, Arc<PaperBroker>>>,
}

pub(crate) async fn harness(slaves: &[&str]) -> Harness {
    harness_with(Harness::settings(), slaves).await
}

pub(crate) async fn harness_with(settings: EngineSettings, slaves: &[&str]) -> Harness {
    let db = Database::in_memory().await.unwrap();
    Harness::on_database(settings, db, slaves).await
}

impl Harness {
    /// Fast ticks and immediate retries.
    pub fn settings() -> EngineSettings {
        EngineSettings {
            poll_interval_ms: 10,
            drain_interval_ms: 10,
            heartbeat_interval_ms: 60_000,
            broker_timeout_ms: 1_000,
            retry_base_ms: 0,
            retry_max_ms: 0,
            ..Default::default()
        }
    }

    pub async fn on_database(settings: EngineSettings, db: Database, slaves: &[&str]) -> Harness {
        let master = Arc::new(PaperBroker::new(dec!(10000)));
        let harness = Harness {
            engine: Engine::new(settings, db, MasterConfig::default(), master.clone()),
            master,
            slaves: Mutex::new(HashMap::new()),
        };
        for name in slaves {
            harness
                .add(SlaveConfig::new(*name, ConnectionDescriptor::default()))
                .await;
        }
        harness
    }

    pub async fn add(&self, config: SlaveConfig) {
        self.add_with(config, Arc::new(PaperBroker::new(dec!(10000)))).await;
    }

    pub async fn add_with(&self, config: SlaveConfig, broker: Arc<PaperBroker>) {
        self.slaves
            .lock()
            .unwrap()
            .insert(config.name.clone(), broker.clone());
        let connection: Arc<dyn BrokerConnection> = broker;
        self.engine
            .add_slave_with_connection(config, connection)
            .await
            .unwrap();
    }

    pub fn slave(&self, name: &str) -> Arc<PaperBroker> {
        self.slaves.lock().unwrap()[name].clone()
    }

    /// Fresh engine over the same database and brokers.
    pub async fn restart(&self) -> Harness {
        self.restart_on(self.engine.database().clone()).await
    }

    pub async fn restart_on(&self, db: Database) -> Harness {
        let restarted = Harness {
            engine: Engine::new(
                self.engine.settings().clone(),
                db,
                MasterConfig::default(),
                self.master.clone(),
            ),
            master: self.master.clone(),
            slaves: Mutex::new(HashMap::new()),
        };
        for view in self.engine.registry().slaves().await {
            let broker = self.slave(&view.config.name);
            restarted.add_with(view.config, broker).await;
        }
        restarted
    }
}
