//! Repair Minder offline cache and sync core.
//!
//! The UI talks to the repositories only. Reads are served from the local
//! SQLite cache first and refreshed from the REST API when online; writes
//! land locally as dirty rows and are pushed by the sync engine. Everything
//! is constructed explicitly through [`SyncCore`]; there are no globals.

pub mod api;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod mapper;
pub mod models;
pub mod network;
pub mod repository;
pub mod scheduler;
pub mod store;
pub mod sync;

#[cfg(test)]
mod test_support;

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use api::{HttpApiClient, RemoteApi, Resource, TokenProvider};
pub use config::{ConfigError, SyncConfig};
pub use error::{ApiError, RepositoryError, StoreError, SyncError};
pub use network::{HealthProbe, NetworkMonitor};
pub use repository::{ClientRepository, DeviceRepository, OrderRepository, TicketRepository};
pub use scheduler::{BackgroundScheduler, IntervalScheduler};
pub use store::LocalStore;
pub use sync::{FullSyncOutcome, SyncEngine, SyncSettings, SyncSnapshot, SyncStatus};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The store, connectivity monitor, sync engine and repositories of one
/// signed-in session.
pub struct SyncCore {
    config: SyncConfig,
    store: LocalStore,
    network: NetworkMonitor,
    engine: SyncEngine,
    probe: Option<Arc<dyn HealthProbe>>,
    pub orders: OrderRepository,
    pub devices: DeviceRepository,
    pub clients: ClientRepository,
    pub tickets: TicketRepository,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncCore {
    /// Open the database named by `config` and talk to the API over HTTP.
    /// Connectivity is then tracked by polling the API's health endpoint.
    pub fn connect(
        config: SyncConfig,
        tokens: Arc<dyn TokenProvider>,
        initially_connected: bool,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let client = Arc::new(HttpApiClient::new(
            &config.api_base_url,
            config.request_timeout(),
            tokens,
        )?);
        let store = LocalStore::open(&config.database_path)?;
        let network = NetworkMonitor::new(initially_connected);

        let mut core = Self::with_store(config, store, client.clone(), network)?;
        core.probe = Some(client as Arc<dyn HealthProbe>);
        Ok(core)
    }

    /// Open the database named by `config` over a caller-supplied API.
    pub fn open(
        config: SyncConfig,
        api: Arc<dyn RemoteApi>,
        network: NetworkMonitor,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let store = LocalStore::open(&config.database_path)?;
        Ok(Self::with_store(config, store, api, network)?)
    }

    pub fn with_store(
        config: SyncConfig,
        store: LocalStore,
        api: Arc<dyn RemoteApi>,
        network: NetworkMonitor,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let engine = SyncEngine::new(
            store.clone(),
            api,
            network.clone(),
            SyncSettings::from(&config),
        );
        Ok(Self {
            orders: OrderRepository::new(engine.clone()),
            devices: DeviceRepository::new(engine.clone()),
            clients: ClientRepository::new(engine.clone()),
            tickets: TicketRepository::new(engine.clone()),
            config,
            store,
            network,
            engine,
            probe: None,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Begin reacting to connectivity changes, register the periodic
    /// background sync and, for HTTP sessions, start the health probe.
    pub fn start(&self, scheduler: &dyn BackgroundScheduler) {
        let mut spawned = vec![self.engine.watch_connectivity(self.cancel.child_token())];
        if let Some(probe) = &self.probe {
            spawned.push(self.network.spawn_health_probe(
                probe.clone(),
                self.config.health_probe_interval(),
                self.cancel.child_token(),
            ));
        }
        self.engine.schedule_background_sync(scheduler);

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(spawned);
        }
        info!(
            "Sync core started (background interval: {}s)",
            self.config.background_interval_secs
        );
    }

    /// Drop every cached record and the sync history.
    pub fn logout(&self) -> Result<(), SyncError> {
        self.engine.clear_local_data()?;
        info!("Local data cleared on logout");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("Sync core stopped");
    }
}

impl Drop for SyncCore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::models::{Order, OrderStatus};
    use crate::scheduler::{ManualScheduler, BACKGROUND_SYNC_TASK_ID};
    use crate::test_support::fixtures::order_json;
    use crate::test_support::FakeApi;

    fn core(api: Arc<FakeApi>, online: bool) -> SyncCore {
        let config = SyncConfig {
            completed_reset_delay_ms: 20,
            ..SyncConfig::default()
        };
        SyncCore::with_store(
            config,
            LocalStore::open_in_memory().unwrap(),
            api,
            NetworkMonitor::new(online),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_wires_reconnect_and_background_sync() {
        let api = Arc::new(FakeApi::new());
        api.set_list(Resource::Orders, vec![order_json("o1", "booked_in")]);
        let core = core(api.clone(), false);
        let scheduler = ManualScheduler::new();
        core.start(&scheduler);

        assert_eq!(scheduler.registered()[0].0, BACKGROUND_SYNC_TASK_ID);

        let mut rx = core.engine().subscribe();
        core.network().set_connected(true);
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.last_sync_date.is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(core.store().get::<Order>("o1").unwrap().is_some());

        core.shutdown();
    }

    #[test]
    fn test_zero_intervals_are_rejected_at_construction() {
        for config in [
            SyncConfig {
                health_probe_interval_secs: 0,
                ..SyncConfig::default()
            },
            SyncConfig {
                background_interval_secs: 0,
                ..SyncConfig::default()
            },
        ] {
            let api = Arc::new(FakeApi::new());
            let result = SyncCore::with_store(
                config.clone(),
                LocalStore::open_in_memory().unwrap(),
                api.clone(),
                NetworkMonitor::new(false),
            );
            assert!(matches!(result, Err(ConfigError::Invalid { .. })));

            let result = SyncCore::open(config, api, NetworkMonitor::new(false));
            assert!(matches!(result, Err(CoreError::Config(_))));
        }
    }

    #[tokio::test]
    async fn test_logout_clears_cache_and_history() {
        let api = Arc::new(FakeApi::new());
        api.set_list(Resource::Orders, vec![order_json("o1", "booked_in")]);
        let core = core(api, true);

        core.engine().perform_full_sync().await.unwrap();
        core.orders
            .update_order_status("o1", OrderStatus::Ready)
            .await
            .unwrap();
        assert!(core.engine().snapshot().last_sync_date.is_some());

        core.logout().unwrap();
        assert!(core.store().get::<Order>("o1").unwrap().is_none());
        assert_eq!(core.store().last_sync_date().unwrap(), None);
        assert_eq!(core.engine().snapshot(), SyncSnapshot::default());
    }
}
