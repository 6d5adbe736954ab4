//! Sync engine: moves data between the local store and the remote API.
//!
//! A full sync pushes every dirty order, device and ticket message, then
//! pulls the first page of orders, devices, clients and tickets. Only one
//! full sync runs at a time; a second call while one is in flight returns
//! [`FullSyncOutcome::AlreadyInProgress`] without touching anything.
//!
//! Observable state (status, last sync date, pending/failed counts) is
//! published on a `watch` channel. Every remote call is bounded by the
//! configured request timeout so a hung request cannot pin the status at
//! `Syncing`.

mod pull;
mod push;

pub use pull::PullReport;
pub use push::{PushError, PushReport};

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{RemoteApi, Resource};
use crate::config::SyncConfig;
use crate::error::{ApiError, SyncError};
use crate::models::{Device, EntityKind, Order, TicketMessage};
use crate::network::NetworkMonitor;
use crate::scheduler::{BackgroundJob, BackgroundScheduler, JobFuture, BACKGROUND_SYNC_TASK_ID};
use crate::store::LocalStore;

// ---------------------------------------------------------------------------
// Observable state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing { progress: f64 },
    Completed,
    Error { message: String },
    Offline,
}

impl SyncStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, SyncStatus::Syncing { .. })
    }
}

/// Everything the UI shows about sync: banner state and counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    pub last_sync_date: Option<DateTime<Utc>>,
    /// Dirty rows across all tables.
    pub pending_changes_count: usize,
    /// Dirty rows that stopped being retried.
    pub failed_changes_count: usize,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            last_sync_date: None,
            pending_changes_count: 0,
            failed_changes_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Entity types that can be pulled on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEntityType {
    Orders,
    Devices,
    Clients,
    Tickets,
}

impl SyncEntityType {
    /// Pull order of a full sync, with the progress reported at each step.
    pub const FULL_SYNC_STEPS: [(SyncEntityType, f64); 4] = [
        (SyncEntityType::Orders, 0.3),
        (SyncEntityType::Devices, 0.5),
        (SyncEntityType::Clients, 0.7),
        (SyncEntityType::Tickets, 0.9),
    ];

    pub fn resource(&self) -> Resource {
        match self {
            SyncEntityType::Orders => Resource::Orders,
            SyncEntityType::Devices => Resource::Devices,
            SyncEntityType::Clients => Resource::Clients,
            SyncEntityType::Tickets => Resource::Tickets,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            SyncEntityType::Orders => EntityKind::Orders,
            SyncEntityType::Devices => EntityKind::Devices,
            SyncEntityType::Clients => EntityKind::Clients,
            SyncEntityType::Tickets => EntityKind::Tickets,
        }
    }
}

/// A local mutation waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    OrderUpdated { id: String },
    DeviceUpdated { id: String },
    TicketMessageCreated { id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub push: PushReport,
    pub pulls: Vec<PullReport>,
}

impl SyncReport {
    pub fn pull(&self, kind: EntityKind) -> Option<&PullReport> {
        self.pulls.iter().find(|p| p.entity == kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FullSyncOutcome {
    Completed(SyncReport),
    /// Another full sync holds the single-flight slot.
    AlreadyInProgress,
    /// No connectivity; status set to `Offline`.
    Offline,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub page_size: u32,
    pub search_page_size: u32,
    pub request_timeout: Duration,
    pub completed_reset_delay: Duration,
    pub background_interval: Duration,
    pub max_push_attempts: u32,
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            search_page_size: config.search_page_size,
            request_timeout: config.request_timeout(),
            completed_reset_delay: config.completed_reset_delay(),
            background_interval: config.background_interval(),
            max_push_attempts: config.max_push_attempts,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

struct EngineInner {
    store: LocalStore,
    api: Arc<dyn RemoteApi>,
    network: NetworkMonitor,
    settings: SyncSettings,
    state: watch::Sender<SyncSnapshot>,
    full_sync_running: AtomicBool,
    /// Serialises push phases so a row is never sent twice concurrently.
    push_lock: AsyncMutex<()>,
    /// Bumped on every `Completed` so stale idle-reset timers do nothing.
    reset_generation: AtomicU64,
}

/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

/// Holds the single-flight slot; releases it on drop.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bound a remote call by `limit`.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout),
    }
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        api: Arc<dyn RemoteApi>,
        network: NetworkMonitor,
        settings: SyncSettings,
    ) -> Self {
        let last_sync_date = store.last_sync_date().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load last sync date");
            None
        });
        let (state, _rx) = watch::channel(SyncSnapshot {
            last_sync_date,
            ..SyncSnapshot::default()
        });

        let engine = Self {
            inner: Arc::new(EngineInner {
                store,
                api,
                network,
                settings,
                state,
                full_sync_running: AtomicBool::new(false),
                push_lock: AsyncMutex::new(()),
                reset_generation: AtomicU64::new(0),
            }),
        };
        engine.refresh_counts();
        engine
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state.borrow().status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.network.is_connected()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    pub(crate) fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub(crate) fn api(&self) -> &dyn RemoteApi {
        self.inner.api.as_ref()
    }

    pub(crate) async fn call<T>(
        &self,
        call: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        with_timeout(self.inner.settings.request_timeout, call).await
    }

    fn set_status(&self, status: SyncStatus) {
        self.inner.state.send_if_modified(|snapshot| {
            if snapshot.status == status {
                return false;
            }
            debug!(from = ?snapshot.status, to = ?status, "sync status");
            snapshot.status = status;
            true
        });
    }

    fn set_progress(&self, progress: f64) {
        self.set_status(SyncStatus::Syncing { progress });
    }

    /// Recompute the pending and failed counters from the store.
    pub fn refresh_counts(&self) {
        let store = &self.inner.store;
        let pending = store.count_pending();
        let failed = store.count_failed(self.inner.settings.max_push_attempts);
        match (pending, failed) {
            (Ok(pending), Ok(failed)) => {
                self.inner.state.send_if_modified(|snapshot| {
                    let changed = snapshot.pending_changes_count != pending
                        || snapshot.failed_changes_count != failed;
                    snapshot.pending_changes_count = pending;
                    snapshot.failed_changes_count = failed;
                    changed
                });
            }
            (Err(e), _) | (_, Err(e)) => warn!(error = %e, "failed to count pending changes"),
        }
    }

    // -- full sync ----------------------------------------------------------

    /// Push all local changes, then pull every entity type.
    pub async fn perform_full_sync(&self) -> Result<FullSyncOutcome, SyncError> {
        if !self.is_connected() {
            self.set_status(SyncStatus::Offline);
            return Ok(FullSyncOutcome::Offline);
        }

        let Some(_flight) = FlightGuard::acquire(&self.inner.full_sync_running) else {
            debug!("full sync already in progress");
            return Ok(FullSyncOutcome::AlreadyInProgress);
        };

        info!("Full sync started");
        self.set_progress(0.0);

        let result = self.run_full_sync().await;
        self.refresh_counts();

        match result {
            Ok(report) => {
                let finished_at = Utc::now();
                if let Err(e) = self.inner.store.set_last_sync_date(finished_at) {
                    warn!(error = %e, "failed to persist last sync date");
                }
                self.inner.state.send_modify(|snapshot| {
                    snapshot.last_sync_date = Some(finished_at);
                });

                if report.push.failed > 0 {
                    let err = SyncError::PushFailed {
                        failed: report.push.failed,
                        first_error: report.push.first_error().unwrap_or_default(),
                    };
                    warn!(error = %err, "Full sync finished with push failures");
                    self.set_status(SyncStatus::Error {
                        message: err.to_string(),
                    });
                    return Err(err);
                }

                if !self.is_connected() {
                    info!("Full sync finished after connectivity was lost");
                    self.set_status(SyncStatus::Offline);
                } else {
                    info!(
                        pushed = report.push.pushed,
                        pulled = report.pulls.iter().map(|p| p.upserted).sum::<usize>(),
                        "Full sync completed"
                    );
                    self.set_status(SyncStatus::Completed);
                    self.schedule_idle_reset();
                }
                Ok(FullSyncOutcome::Completed(report))
            }
            Err(e) => {
                warn!(error = %e, "Full sync failed");
                self.set_status(SyncStatus::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_full_sync(&self) -> Result<SyncReport, SyncError> {
        self.set_progress(0.1);
        let push = self.push_phase().await?;

        let mut pulls = Vec::with_capacity(SyncEntityType::FULL_SYNC_STEPS.len());
        for (entity, progress) in SyncEntityType::FULL_SYNC_STEPS {
            self.set_progress(progress);
            match self.pull(entity).await {
                Ok(report) => pulls.push(report),
                Err(SyncError::Unauthorized) => return Err(SyncError::Unauthorized),
                Err(e) => {
                    warn!(entity = %entity.kind(), error = %e, "pull failed; continuing");
                    pulls.push(PullReport::failed(entity.kind(), &e));
                }
            }
        }

        Ok(SyncReport { push, pulls })
    }

    /// Return to `Idle` after the configured delay if nothing else happened.
    fn schedule_idle_reset(&self) {
        let generation = self.inner.reset_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let delay = self.inner.settings.completed_reset_delay;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.reset_generation.load(Ordering::Acquire) != generation {
                return;
            }
            inner.state.send_if_modified(|snapshot| {
                if snapshot.status == SyncStatus::Completed {
                    snapshot.status = SyncStatus::Idle;
                    true
                } else {
                    false
                }
            });
        });
    }

    // -- partial sync -------------------------------------------------------

    /// Pull one entity type's first page. No push, no status change.
    pub async fn sync(&self, entity: SyncEntityType) -> Result<PullReport, SyncError> {
        if !self.is_connected() {
            return Err(SyncError::Api(ApiError::Offline));
        }
        self.pull(entity).await
    }

    // -- local changes ------------------------------------------------------

    /// Flag the referenced row for push. Safe to call repeatedly.
    pub fn queue_change(&self, change: &LocalChange) {
        let store = &self.inner.store;
        let (kind, id, result) = match change {
            LocalChange::OrderUpdated { id } => {
                (EntityKind::Orders, id, store.mark_dirty::<Order>(id, &[]))
            }
            LocalChange::DeviceUpdated { id } => {
                (EntityKind::Devices, id, store.mark_dirty::<Device>(id, &[]))
            }
            LocalChange::TicketMessageCreated { id } => (
                EntityKind::TicketMessages,
                id,
                store.mark_dirty::<TicketMessage>(id, &[]),
            ),
        };
        match result {
            Ok(true) => debug!(entity = %kind, id = %id, "queued local change"),
            Ok(false) => warn!(entity = %kind, id = %id, "queued change for a missing row"),
            Err(e) => warn!(entity = %kind, id = %id, error = %e, "failed to queue local change"),
        }
        self.refresh_counts();
    }

    /// Push every eligible dirty row now.
    pub async fn push_local_changes(&self) -> Result<PushReport, SyncError> {
        if !self.is_connected() {
            return Err(SyncError::Api(ApiError::Offline));
        }
        let result = self.push_phase().await;
        self.refresh_counts();
        result
    }

    /// Put parked changes back into the push queue.
    pub fn retry_failed_changes(&self) -> Result<usize, SyncError> {
        let reset = self.inner.store.reset_push_attempts()?;
        if reset > 0 {
            info!(count = reset, "re-queued parked local changes");
        }
        self.refresh_counts();
        Ok(reset)
    }

    /// Wipe the cache and the sync bookkeeping, e.g. on logout.
    pub fn clear_local_data(&self) -> Result<(), SyncError> {
        self.inner.store.reset()?;
        self.inner.state.send_modify(|snapshot| *snapshot = SyncSnapshot::default());
        Ok(())
    }

    // -- reactivity ---------------------------------------------------------

    /// Full sync on every transition to connected; `Offline` immediately on
    /// every transition to disconnected. The current value at subscription
    /// time is not treated as a transition.
    pub fn watch_connectivity(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let mut rx = self.inner.network.subscribe();
        rx.borrow_and_update();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = *rx.borrow_and_update();
                        if connected {
                            info!("Network restored; starting full sync");
                            let engine = engine.clone();
                            tokio::spawn(async move {
                                if let Err(e) = engine.perform_full_sync().await {
                                    warn!(error = %e, "sync after reconnect failed");
                                }
                            });
                        } else {
                            info!("Network lost; sync offline");
                            engine.set_status(SyncStatus::Offline);
                        }
                    }
                }
            }
            debug!("connectivity watcher stopped");
        })
    }

    /// Register the periodic best-effort full sync.
    pub fn schedule_background_sync(&self, scheduler: &dyn BackgroundScheduler) {
        let engine = self.clone();
        let job: BackgroundJob = Arc::new(move || -> JobFuture {
            let engine = engine.clone();
            Box::pin(async move {
                debug!("background sync wake");
                if let Err(e) = engine.perform_full_sync().await {
                    warn!(error = %e, "background sync failed");
                }
            })
        });
        scheduler.run_periodically(
            BACKGROUND_SYNC_TASK_ID,
            self.inner.settings.background_interval,
            job,
        );
    }
}
