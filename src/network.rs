//! Connectivity signal.
//!
//! The host feeds reachability changes in (from the OS path monitor) and/or
//! lets the built-in health probe poll the API. Subscribers only see
//! transitions, never repeated values.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::HttpApiClient;

#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_connected);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Publish a reachability reading. Returns `true` if it was a transition.
    pub fn set_connected(&self, connected: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
        if changed {
            info!(connected, "network reachability changed");
        }
        changed
    }

    /// Poll `probe` every `every` and publish the result until cancelled.
    pub fn spawn_health_probe(
        &self,
        probe: Arc<dyn HealthProbe>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            info!("Health probe started (interval: {}s)", every.as_secs());
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Health probe stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let online = probe.is_reachable().await;
                        debug!(online, "health probe");
                        monitor.set_connected(online);
                    }
                }
            }
        })
    }
}

/// Something that can tell whether the API is reachable right now.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

#[async_trait]
impl HealthProbe for HttpApiClient {
    async fn is_reachable(&self) -> bool {
        self.health_check().await.is_ok()
    }
}
