use rusqlite::types::Value as SqlValue;
use tokio::sync::watch;

use super::{CachedTable, ListState};
use crate::error::RepositoryError;
use crate::mapper::{opt_text_value, text_value};
use crate::models::{Order, OrderStatus};
use crate::store::Query;
use crate::sync::{LocalChange, SyncEngine, SyncEntityType};

/// Fields staff can change on an order. `None` leaves a field as is;
/// `notes: Some(None)` clears the notes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderChanges {
    pub status: Option<OrderStatus>,
    pub notes: Option<Option<String>>,
}

impl OrderChanges {
    fn columns(&self) -> Vec<(&'static str, SqlValue)> {
        let mut columns = Vec::new();
        if let Some(status) = &self.status {
            columns.push(("status", text_value(status.as_str())));
        }
        if let Some(notes) = &self.notes {
            columns.push(("notes", opt_text_value(notes.as_deref())));
        }
        columns
    }
}

pub struct OrderRepository {
    table: CachedTable<Order>,
}

impl OrderRepository {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            table: CachedTable::new(engine, Some(SyncEntityType::Orders)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ListState<Order>> {
        self.table.list().subscribe()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.table.list().items()
    }

    /// Newest first, optionally limited to one status.
    pub async fn fetch_orders(
        &self,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, RepositoryError> {
        let mut query = Query::new().newest_first("created_at");
        if let Some(status) = status {
            query = query.eq("status", status.as_str().to_string());
        }
        self.table.fetch(query).await
    }

    pub async fn fetch_active_orders(&self) -> Result<Vec<Order>, RepositoryError> {
        let active = OrderStatus::active()
            .into_iter()
            .map(|s| s.as_str().to_string());
        let query = Query::new()
            .any_of("status", active)
            .newest_first("created_at");
        self.table.fetch(query).await
    }

    /// Cached orders of one client. Local only.
    pub fn orders_for_client(&self, client_id: &str) -> Result<Vec<Order>, RepositoryError> {
        let query = Query::new()
            .eq("client_id", client_id.to_string())
            .newest_first("created_at");
        Ok(self.table.store().fetch::<Order>(&query)?)
    }

    pub async fn fetch_order(&self, id: &str) -> Result<Option<Order>, RepositoryError> {
        self.table.fetch_one(id).await
    }

    pub async fn update_order(
        &self,
        id: &str,
        changes: &OrderChanges,
    ) -> Result<Order, RepositoryError> {
        self.table
            .update(
                id,
                &changes.columns(),
                LocalChange::OrderUpdated { id: id.to_string() },
            )
            .await
    }

    pub async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
    ) -> Result<Order, RepositoryError> {
        let changes = OrderChanges {
            status: Some(status),
            ..OrderChanges::default()
        };
        self.update_order(id, &changes).await
    }

    pub async fn update_order_notes(
        &self,
        id: &str,
        notes: Option<&str>,
    ) -> Result<Order, RepositoryError> {
        let changes = OrderChanges {
            notes: Some(notes.map(str::to_string)),
            ..OrderChanges::default()
        };
        self.update_order(id, &changes).await
    }
}
