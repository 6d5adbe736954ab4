//! Cache-first facades the UI calls.
//!
//! A list read publishes what the local store holds right away, refreshes
//! the table from the server when online, then publishes the store again.
//! A write lands in the store as a dirty row, is queued with the sync
//! engine and, when online, pushed straight away. Published lists are always
//! a fresh read of the store, never edited in place.

mod client;
mod device;
mod order;
mod ticket;

pub use client::ClientRepository;
pub use device::{DeviceChanges, DeviceRepository};
pub use order::{OrderChanges, OrderRepository};
pub use ticket::TicketRepository;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{ApiError, RepositoryError, SyncError};
use crate::mapper::{TableRow, WireRecord};
use crate::store::{LocalStore, Query};
use crate::sync::{LocalChange, PullReport, SyncEngine, SyncEntityType};

/// What a list screen renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListState<T> {
    pub items: Vec<T>,
    pub is_loading: bool,
    /// User-facing message from the last failed read.
    pub error: Option<String>,
}

impl<T> Default for ListState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            is_loading: false,
            error: None,
        }
    }
}

/// Observable list state. Receivers see every publish.
pub struct Published<T> {
    tx: watch::Sender<ListState<T>>,
}

impl<T: Clone> Published<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ListState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ListState<T>> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> ListState<T> {
        self.tx.borrow().clone()
    }

    pub fn items(&self) -> Vec<T> {
        self.tx.borrow().items.clone()
    }

    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.tx.borrow().items.iter().find(|item| pred(item)).cloned()
    }

    fn start_loading(&self) {
        self.tx.send_modify(|state| {
            state.is_loading = true;
            state.error = None;
        });
    }

    fn publish(&self, items: Vec<T>) {
        self.tx.send_modify(|state| state.items = items);
    }

    fn finish(&self, error: Option<String>) {
        self.tx.send_modify(|state| {
            state.is_loading = false;
            state.error = error;
        });
    }
}

impl<T: Clone> Default for Published<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared cache-first plumbing for one table.
pub(crate) struct CachedTable<E> {
    engine: SyncEngine,
    /// `None` for tables with no single-record endpoint.
    entity: Option<SyncEntityType>,
    list: Published<E>,
    /// Query of the most recent fetch; republished after local writes.
    query: Mutex<Query>,
    /// Bumped per fetch. Only the newest fetch publishes.
    generation: AtomicU64,
}

impl<E: TableRow + WireRecord> CachedTable<E> {
    pub(crate) fn new(engine: SyncEngine, entity: Option<SyncEntityType>) -> Self {
        Self {
            engine,
            entity,
            list: Published::new(),
            query: Mutex::new(Query::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub(crate) fn store(&self) -> &LocalStore {
        self.engine.store()
    }

    pub(crate) fn list(&self) -> &Published<E> {
        &self.list
    }

    /// Publish `query`'s rows, run `refresh` when online, publish again.
    /// A refresh failure is logged and the cached rows stand, except for an
    /// expired session which is reported.
    pub(crate) async fn fetch_with<F, Fut>(
        &self,
        query: Query,
        refresh: F,
    ) -> Result<Vec<E>, RepositoryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PullReport, SyncError>>,
    {
        let generation = self.begin(&query);
        let cached = self.read(&query, generation)?;

        if !self.engine.is_connected() {
            self.finish(generation, None);
            return Ok(cached);
        }

        match refresh().await {
            Ok(report) => debug!(entity = %E::KIND, upserted = report.upserted, "refreshed from server"),
            Err(SyncError::Unauthorized) => {
                let err = RepositoryError::Remote(ApiError::Unauthorized);
                self.finish(generation, Some(err.user_message()));
                return Err(err);
            }
            Err(e) => warn!(entity = %E::KIND, error = %e, "refresh failed; showing cached data"),
        }

        let items = self.read(&query, generation)?;
        self.finish(generation, None);
        Ok(items)
    }

    fn begin(&self, query: &Query) -> u64 {
        let generation = {
            let mut current = self.query.lock().unwrap_or_else(PoisonError::into_inner);
            *current = query.clone();
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.list.start_loading();
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn finish(&self, generation: u64, error: Option<String>) {
        if self.is_current(generation) {
            self.list.finish(error);
        }
    }

    /// Read `query` and publish the rows if no newer fetch has started.
    fn read(&self, query: &Query, generation: u64) -> Result<Vec<E>, RepositoryError> {
        match self.store().fetch::<E>(query) {
            Ok(items) => {
                if self.is_current(generation) {
                    self.list.publish(items.clone());
                }
                Ok(items)
            }
            Err(e) => {
                let err = RepositoryError::from(e);
                warn!(entity = %E::KIND, error = %err, "failed to read local store");
                self.finish(generation, Some(err.user_message()));
                Err(err)
            }
        }
    }

    /// Pull this table's first page as the refresh step.
    pub(crate) async fn fetch(&self, query: Query) -> Result<Vec<E>, RepositoryError> {
        match self.entity {
            Some(entity) => self.fetch_with(query, || self.engine.sync(entity)).await,
            None => self.fetch_with(query, || async { Ok(PullReport::none(E::KIND)) }).await,
        }
    }

    /// Re-read the most recent fetch's query and publish it.
    pub(crate) fn reload(&self) -> Result<Vec<E>, RepositoryError> {
        let (query, generation) = {
            let current = self.query.lock().unwrap_or_else(PoisonError::into_inner);
            (current.clone(), self.generation.load(Ordering::SeqCst))
        };
        self.read(&query, generation)
    }

    /// Published list, then local store, then (online only) the server.
    pub(crate) async fn fetch_one(&self, id: &str) -> Result<Option<E>, RepositoryError> {
        if let Some(found) = self.list.find(|item| item.id() == id) {
            return Ok(Some(found));
        }
        if let Some(found) = self.store().get::<E>(id)? {
            return Ok(Some(found));
        }
        let Some(entity) = self.entity else {
            return Ok(None);
        };
        if !self.engine.is_connected() {
            return Ok(None);
        }
        debug!(entity = %E::KIND, id, "not cached; asking the server");
        Ok(self
            .engine
            .fetch_remote::<E>(entity.resource(), id)
            .await?)
    }

    /// Write `fields` locally as a dirty row, queue `change`, republish, and
    /// push right away when online.
    pub(crate) async fn update(
        &self,
        id: &str,
        fields: &[(&'static str, SqlValue)],
        change: LocalChange,
    ) -> Result<E, RepositoryError> {
        if fields.is_empty() {
            return self.store().get::<E>(id)?.ok_or(RepositoryError::NotFound);
        }
        if !self.store().mark_dirty::<E>(id, fields)? {
            return Err(RepositoryError::NotFound);
        }
        self.engine.queue_change(&change);
        self.reload_logged();

        self.push_now().await;

        self.store().get::<E>(id)?.ok_or(RepositoryError::NotFound)
    }

    pub(crate) fn reload_logged(&self) {
        if let Err(e) = self.reload() {
            debug!(entity = %E::KIND, error = %e, "republish after write failed");
        }
    }

    /// Opportunistic push; the change stays queued on any failure.
    pub(crate) async fn push_now(&self) {
        if !self.engine.is_connected() {
            debug!(entity = %E::KIND, "offline; change queued for next sync");
            return;
        }
        match self.engine.push_local_changes().await {
            Ok(report) if report.failed > 0 => warn!(
                failed = report.failed,
                first_error = ?report.first_error(),
                "immediate push left changes queued"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "immediate push failed; change stays queued"),
        }
    }
}
