use rust_decimal::Decimal;
use rusqlite::types::Value as SqlValue;
use tokio::sync::watch;

use super::{CachedTable, ListState};
use crate::error::RepositoryError;
use crate::mapper::{decimal_value, opt_text_value, text_value};
use crate::models::{Device, DeviceStatus};
use crate::store::Query;
use crate::sync::{LocalChange, SyncEngine, SyncEntityType};

/// Fields a technician can change on a device. All of them travel in the
/// push payload. `Some(None)` clears a field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceChanges {
    pub status: Option<DeviceStatus>,
    pub diagnosis: Option<Option<String>>,
    pub resolution: Option<Option<String>>,
    pub price: Option<Option<Decimal>>,
}

impl DeviceChanges {
    fn columns(&self) -> Vec<(&'static str, SqlValue)> {
        let mut columns = Vec::new();
        if let Some(status) = &self.status {
            columns.push(("status", text_value(status.as_str())));
        }
        if let Some(diagnosis) = &self.diagnosis {
            columns.push(("diagnosis", opt_text_value(diagnosis.as_deref())));
        }
        if let Some(resolution) = &self.resolution {
            columns.push(("resolution", opt_text_value(resolution.as_deref())));
        }
        if let Some(price) = &self.price {
            columns.push(("price", decimal_value(price.as_ref())));
        }
        columns
    }
}

pub struct DeviceRepository {
    table: CachedTable<Device>,
}

impl DeviceRepository {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            table: CachedTable::new(engine, Some(SyncEntityType::Devices)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ListState<Device>> {
        self.table.list().subscribe()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.table.list().items()
    }

    pub async fn fetch_devices(
        &self,
        status: Option<DeviceStatus>,
    ) -> Result<Vec<Device>, RepositoryError> {
        let mut query = Query::new().newest_first("created_at");
        if let Some(status) = status {
            query = query.eq("status", status.as_str().to_string());
        }
        self.table.fetch(query).await
    }

    pub async fn fetch_devices_for_order(
        &self,
        order_id: &str,
    ) -> Result<Vec<Device>, RepositoryError> {
        let query = Query::new()
            .eq("order_id", order_id.to_string())
            .oldest_first("created_at");
        self.table.fetch(query).await
    }

    /// Devices not yet handed back, most recently touched first.
    pub async fn fetch_active_devices(&self) -> Result<Vec<Device>, RepositoryError> {
        self.table.fetch(active_query().newest_first("updated_at")).await
    }

    /// Active devices assigned to one technician.
    pub async fn fetch_my_queue(&self, user_id: &str) -> Result<Vec<Device>, RepositoryError> {
        let query = active_query()
            .eq("assigned_user_id", user_id.to_string())
            .oldest_first("created_at");
        self.table.fetch(query).await
    }

    pub async fn fetch_device(&self, id: &str) -> Result<Option<Device>, RepositoryError> {
        self.table.fetch_one(id).await
    }

    pub async fn update_device(
        &self,
        id: &str,
        changes: &DeviceChanges,
    ) -> Result<Device, RepositoryError> {
        self.table
            .update(
                id,
                &changes.columns(),
                LocalChange::DeviceUpdated { id: id.to_string() },
            )
            .await
    }

    pub async fn update_device_status(
        &self,
        id: &str,
        status: DeviceStatus,
    ) -> Result<Device, RepositoryError> {
        let changes = DeviceChanges {
            status: Some(status),
            ..DeviceChanges::default()
        };
        self.update_device(id, &changes).await
    }

    pub async fn update_device_diagnosis(
        &self,
        id: &str,
        diagnosis: Option<&str>,
    ) -> Result<Device, RepositoryError> {
        let changes = DeviceChanges {
            diagnosis: Some(diagnosis.map(str::to_string)),
            ..DeviceChanges::default()
        };
        self.update_device(id, &changes).await
    }

    pub async fn update_device_resolution(
        &self,
        id: &str,
        resolution: Option<&str>,
    ) -> Result<Device, RepositoryError> {
        let changes = DeviceChanges {
            resolution: Some(resolution.map(str::to_string)),
            ..DeviceChanges::default()
        };
        self.update_device(id, &changes).await
    }

    pub async fn update_device_price(
        &self,
        id: &str,
        price: Option<Decimal>,
    ) -> Result<Device, RepositoryError> {
        let changes = DeviceChanges {
            price: Some(price),
            ..DeviceChanges::default()
        };
        self.update_device(id, &changes).await
    }
}

fn active_query() -> Query {
    let active = DeviceStatus::active()
        .into_iter()
        .map(|s| s.as_str().to_string());
    Query::new().any_of("status", active)
}
