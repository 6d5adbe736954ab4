//! Pull phase: fetch a page of server records and merge it into the store.
//!
//! Decoding is per record and merging goes through the guarded upsert, so a
//! malformed record is skipped and a locally modified row is never
//! overwritten.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{SyncEngine, SyncEntityType};
use crate::api::{ListFilters, Resource};
use crate::error::{ApiError, SyncError};
use crate::mapper::{decode_batch, decode_record, TableRow, WireRecord};
use crate::models::{Client, Device, EntityKind, Order, Ticket, TicketMessage};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullReport {
    pub entity: EntityKind,
    pub fetched: usize,
    pub decoded: usize,
    pub decode_failures: usize,
    /// Rows inserted or updated.
    pub upserted: usize,
    pub unchanged: usize,
    /// Rows left alone because they hold unpushed local changes.
    pub skipped_dirty: usize,
    pub error: Option<String>,
}

impl PullReport {
    /// Nothing fetched, nothing failed.
    pub fn none(entity: EntityKind) -> Self {
        Self {
            entity,
            fetched: 0,
            decoded: 0,
            decode_failures: 0,
            upserted: 0,
            unchanged: 0,
            skipped_dirty: 0,
            error: None,
        }
    }

    pub(super) fn failed(entity: EntityKind, err: &SyncError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::none(entity)
        }
    }
}

impl SyncEngine {
    pub(super) async fn pull(&self, entity: SyncEntityType) -> Result<PullReport, SyncError> {
        let page_size = self.inner.settings.page_size;
        let values = self
            .call(self.api().list(entity.resource(), 1, page_size, &ListFilters::default()))
            .await?;

        match entity {
            SyncEntityType::Orders => self.merge::<Order>(values),
            SyncEntityType::Devices => self.merge::<Device>(values),
            SyncEntityType::Clients => self.merge::<Client>(values),
            SyncEntityType::Tickets => self.merge::<Ticket>(values),
        }
    }

    fn merge<E: TableRow + WireRecord>(&self, values: Vec<Value>) -> Result<PullReport, SyncError> {
        let fetched = values.len();
        let batch = decode_batch::<E>(E::KIND, values);
        if batch.is_total_failure() {
            warn!(entity = %E::KIND, failures = batch.failures.len(), "no record in the page could be decoded");
        }

        let summary = self.store().upsert_batch(&batch.records)?;
        let report = PullReport {
            entity: E::KIND,
            fetched,
            decoded: batch.records.len(),
            decode_failures: batch.failures.len(),
            upserted: summary.written(),
            unchanged: summary.unchanged,
            skipped_dirty: summary.skipped_dirty,
            error: None,
        };
        debug!(
            entity = %E::KIND,
            fetched,
            upserted = report.upserted,
            skipped_dirty = report.skipped_dirty,
            "pulled"
        );
        Ok(report)
    }

    fn ensure_online(&self) -> Result<(), SyncError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::Api(ApiError::Offline))
        }
    }

    /// Server-side client search; matches are cached like a pull.
    pub async fn search_clients(&self, text: &str) -> Result<PullReport, SyncError> {
        self.ensure_online()?;
        let limit = self.inner.settings.search_page_size;
        let values = self
            .call(self.api().list(Resource::Clients, 1, limit, &ListFilters::search(text)))
            .await?;
        self.merge::<Client>(values)
    }

    /// Fetch and cache a ticket's conversation.
    pub async fn pull_ticket_messages(&self, ticket_id: &str) -> Result<PullReport, SyncError> {
        self.ensure_online()?;
        let values = self.call(self.api().list_ticket_messages(ticket_id)).await?;
        self.merge::<TicketMessage>(values)
    }

    /// One-off lookup of a single record, cached on arrival. Returns the
    /// local copy when it holds unpushed changes, and `None` when the server
    /// does not know the id.
    pub async fn fetch_remote<E: TableRow + WireRecord>(
        &self,
        resource: Resource,
        id: &str,
    ) -> Result<Option<E>, SyncError> {
        self.ensure_online()?;
        let value = match self.call(self.api().get(resource, id)).await {
            Ok(value) => value,
            Err(ApiError::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record =
            decode_record::<E>(value).map_err(|e| SyncError::Api(ApiError::Decode(e)))?;
        self.store().upsert(&record)?;
        Ok(self.store().get::<E>(record.id())?.or(Some(record)))
    }
}
