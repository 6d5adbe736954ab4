//! Push phase: send dirty rows to the server, oldest first.
//!
//! Orders, then devices, then new ticket messages. A failure on one row is
//! recorded against that row and the phase moves on; a 401 ends the whole
//! sync, and a connectivity failure or a 429 ends the phase since every
//! following call would fail the same way.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::SyncEngine;
use crate::api::Resource;
use crate::error::{ApiError, StoreError, SyncError};
use crate::mapper::{decode_record, device_update_payload, new_message_payload, order_update_payload};
use crate::models::{Device, EntityKind, Order, TicketMessage};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushError {
    pub entity: EntityKind,
    pub id: String,
    pub error: String,
    /// No further automatic attempts until `retry_failed_changes`.
    pub parked: bool,
    /// A later cycle may succeed with the same payload.
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PushReport {
    pub pushed: usize,
    pub failed: usize,
    pub parked: usize,
    /// Stopped early on a connectivity failure.
    pub aborted: bool,
    pub errors: Vec<PushError>,
}

impl PushReport {
    pub fn first_error(&self) -> Option<String> {
        self.errors.first().map(|e| e.error.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Abort,
}

impl SyncEngine {
    pub(super) async fn push_phase(&self) -> Result<PushReport, SyncError> {
        let _push = self.inner.push_lock.lock().await;
        let mut report = PushReport::default();

        if self.push_orders(&mut report).await? == Flow::Continue
            && self.push_devices(&mut report).await? == Flow::Continue
        {
            self.push_messages(&mut report).await?;
        }

        if report.pushed > 0 || report.failed > 0 {
            info!(
                pushed = report.pushed,
                failed = report.failed,
                parked = report.parked,
                "Push phase finished"
            );
        }
        Ok(report)
    }

    async fn push_orders(&self, report: &mut PushReport) -> Result<Flow, SyncError> {
        let max = self.inner.settings.max_push_attempts;
        for order in self.store().pending::<Order>(max)? {
            let body = order_update_payload(&order);
            match self.call(self.api().update(Resource::Orders, &order.id, body)).await {
                Ok(()) => {
                    let cleared = self.store().mark_pushed(&order);
                    settle_pushed(report, EntityKind::Orders, &order.id, cleared);
                }
                Err(err) => {
                    if self.settle_failed(report, EntityKind::Orders, &order.id, err)? == Flow::Abort {
                        return Ok(Flow::Abort);
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn push_devices(&self, report: &mut PushReport) -> Result<Flow, SyncError> {
        let max = self.inner.settings.max_push_attempts;
        for device in self.store().pending::<Device>(max)? {
            let body = device_update_payload(&device);
            match self.call(self.api().update(Resource::Devices, &device.id, body)).await {
                Ok(()) => {
                    let cleared = self.store().mark_pushed(&device);
                    settle_pushed(report, EntityKind::Devices, &device.id, cleared);
                }
                Err(err) => {
                    if self.settle_failed(report, EntityKind::Devices, &device.id, err)? == Flow::Abort {
                        return Ok(Flow::Abort);
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Locally written messages carry a temporary id; on success the row is
    /// replaced by the server's record.
    async fn push_messages(&self, report: &mut PushReport) -> Result<Flow, SyncError> {
        let max = self.inner.settings.max_push_attempts;
        for message in self.store().pending::<TicketMessage>(max)? {
            let body = new_message_payload(&message);
            let sent = self
                .call(self.api().send_ticket_message(&message.ticket_id, body))
                .await;
            match sent {
                Ok(created) => {
                    let stored = match decode_record::<TicketMessage>(created) {
                        Ok(server) => self
                            .store()
                            .replace_local_row(&message.id, &server)
                            .map(|()| true),
                        Err(e) => {
                            warn!(id = %message.id, error = %e, "sent message but could not read the reply; keeping local copy");
                            self.store().mark_clean(EntityKind::TicketMessages, &message.id)
                        }
                    };
                    settle_pushed(report, EntityKind::TicketMessages, &message.id, stored);
                }
                Err(err) => {
                    if self.settle_failed(report, EntityKind::TicketMessages, &message.id, err)?
                        == Flow::Abort
                    {
                        return Ok(Flow::Abort);
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn settle_failed(
        &self,
        report: &mut PushReport,
        entity: EntityKind,
        id: &str,
        err: ApiError,
    ) -> Result<Flow, SyncError> {
        if err.requires_reauth() {
            warn!(entity = %entity, id, "push rejected: session expired");
            return Err(SyncError::Unauthorized);
        }

        let message = err.to_string();
        if let ApiError::RateLimited { retry_after } = &err {
            // throttling says nothing about this row; its attempts are untouched
            warn!(entity = %entity, id, retry_after_secs = ?retry_after, "rate limited; stopping push phase");
            report.failed += 1;
            report.errors.push(PushError {
                entity,
                id: id.to_string(),
                error: message,
                parked: false,
                retryable: err.is_retryable(),
            });
            report.aborted = true;
            return Ok(Flow::Abort);
        }

        let parked = match self.store().record_push_failure(
            entity,
            id,
            &message,
            err.is_permanent(),
            self.inner.settings.max_push_attempts,
        ) {
            Ok(failure) => failure.parked,
            Err(e) => {
                warn!(entity = %entity, id, error = %e, "failed to record push failure");
                false
            }
        };
        warn!(entity = %entity, id, error = %message, "push failed");

        report.failed += 1;
        if parked {
            report.parked += 1;
        }
        report.errors.push(PushError {
            entity,
            id: id.to_string(),
            error: message,
            parked,
            retryable: !parked && err.is_retryable(),
        });

        if err.is_connectivity() {
            warn!("connectivity lost; stopping push phase");
            report.aborted = true;
            return Ok(Flow::Abort);
        }
        Ok(Flow::Continue)
    }
}

/// The server accepted the change. A local bookkeeping failure only means
/// the row is pushed again next cycle.
fn settle_pushed(
    report: &mut PushReport,
    entity: EntityKind,
    id: &str,
    cleared: Result<bool, StoreError>,
) {
    report.pushed += 1;
    match cleared {
        Ok(true) => debug!(entity = %entity, id, "pushed"),
        Ok(false) => debug!(entity = %entity, id, "pushed; row edited again meanwhile"),
        Err(e) => warn!(entity = %entity, id, error = %e, "pushed but failed to clear the dirty flag"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rusqlite::types::Value as SqlValue;

    use crate::models::{DeviceStatus, OrderStatus, SenderType};
    use crate::test_support::fixtures::{device, message, order};
    use crate::test_support::{engine_with, FakeApi};

    fn set_status(value: &str) -> [(&'static str, SqlValue); 1] {
        [("status", SqlValue::from(value.to_string()))]
    }

    #[tokio::test]
    async fn test_dirty_row_is_pushed_then_clean() {
        let api = Arc::new(FakeApi::new());
        let (engine, store, _network) = engine_with(api.clone(), true);
        store.upsert(&order("o1", OrderStatus::BookedIn)).unwrap();
        store.mark_dirty::<Order>("o1", &set_status("in_progress")).unwrap();

        let report = engine.push_local_changes().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.failed, 0);

        let updates = api.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, Resource::Orders);
        assert_eq!(updates[0].1, "o1");
        assert_eq!(updates[0].2["status"], "in_progress");

        let row = store.get_row::<Order>("o1").unwrap().unwrap();
        assert!(!row.meta.needs_sync);
        assert!(row.meta.synced_at.is_some());
        assert_eq!(engine.snapshot().pending_changes_count, 0);

        // nothing left to send
        assert_eq!(engine.push_local_changes().await.unwrap().pushed, 0);
        assert_eq!(api.updates().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_push_keeps_row_dirty_and_continues() {
        let api = Arc::new(FakeApi::new());
        api.fail_update(
            "o1",
            ApiError::Server {
                status: 503,
                message: "maintenance".into(),
            },
        );
        let (engine, store, _network) = engine_with(api.clone(), true);
        for id in ["o1", "o2"] {
            store.upsert(&order(id, OrderStatus::BookedIn)).unwrap();
            store.mark_dirty::<Order>(id, &set_status("ready")).unwrap();
        }

        let report = engine.push_local_changes().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.aborted);
        assert_eq!(report.errors[0].id, "o1");
        assert!(!report.errors[0].parked);
        assert!(report.errors[0].retryable);

        let failed = store.get_row::<Order>("o1").unwrap().unwrap();
        assert!(failed.meta.needs_sync);
        assert_eq!(failed.meta.sync_attempts, 1);
        assert!(failed.meta.last_sync_error.unwrap().contains("503"));
        assert_eq!(failed.record.status, OrderStatus::Ready);
        assert!(!store.get_row::<Order>("o2").unwrap().unwrap().meta.needs_sync);
    }

    #[tokio::test]
    async fn test_rate_limit_stops_phase_without_counting_attempt() {
        let api = Arc::new(FakeApi::new());
        api.fail_all_updates(ApiError::RateLimited {
            retry_after: Some(30),
        });
        let (engine, store, _network) = engine_with(api.clone(), true);
        for id in ["o1", "o2"] {
            store.upsert(&order(id, OrderStatus::BookedIn)).unwrap();
            store.mark_dirty::<Order>(id, &set_status("ready")).unwrap();
        }
        store.upsert(&device("d1", "o1", DeviceStatus::Diagnosing)).unwrap();
        store.mark_dirty::<Device>("d1", &set_status("repairing")).unwrap();

        let report = engine.push_local_changes().await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.failed, 1);
        assert_eq!(report.parked, 0);
        assert!(report.errors[0].retryable);
        assert_eq!(api.update_calls(), 1);

        for id in ["o1", "o2"] {
            let row = store.get_row::<Order>(id).unwrap().unwrap();
            assert!(row.meta.needs_sync);
            assert_eq!(row.meta.sync_attempts, 0);
        }
        assert_eq!(engine.snapshot().failed_changes_count, 0);
    }

    #[tokio::test]
    async fn test_validation_error_parks_the_change() {
        let api = Arc::new(FakeApi::new());
        api.fail_update(
            "d1",
            ApiError::Validation {
                status: 422,
                message: "price must be positive".into(),
            },
        );
        let (engine, store, _network) = engine_with(api.clone(), true);
        store.upsert(&device("d1", "o1", DeviceStatus::ReadyToQuote)).unwrap();
        store
            .mark_dirty::<Device>("d1", &[("price", SqlValue::from("-5".to_string()))])
            .unwrap();

        let report = engine.push_local_changes().await.unwrap();
        assert_eq!(report.parked, 1);
        assert!(!report.errors[0].retryable);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.pending_changes_count, 1);
        assert_eq!(snapshot.failed_changes_count, 1);

        // parked rows are not retried automatically
        engine.push_local_changes().await.unwrap();
        assert_eq!(api.updates().len(), 0);
        assert_eq!(api.update_calls(), 1);

        api.clear_failures();
        assert_eq!(engine.retry_failed_changes().unwrap(), 1);
        let report = engine.push_local_changes().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(engine.snapshot().failed_changes_count, 0);
    }

    #[tokio::test]
    async fn test_connectivity_failure_stops_the_phase() {
        let api = Arc::new(FakeApi::new());
        api.fail_all_updates(ApiError::Offline);
        let (engine, store, _network) = engine_with(api.clone(), true);
        for id in ["o1", "o2"] {
            store.upsert(&order(id, OrderStatus::BookedIn)).unwrap();
            store.mark_dirty::<Order>(id, &set_status("ready")).unwrap();
        }
        store.upsert(&device("d1", "o1", DeviceStatus::Diagnosing)).unwrap();
        store.mark_dirty::<Device>("d1", &set_status("repairing")).unwrap();

        let report = engine.push_local_changes().await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.failed, 1);
        assert_eq!(api.update_calls(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_push_ends_with_error() {
        let api = Arc::new(FakeApi::new());
        api.fail_all_updates(ApiError::Unauthorized);
        let (engine, store, _network) = engine_with(api.clone(), true);
        store.upsert(&order("o1", OrderStatus::BookedIn)).unwrap();
        store.mark_dirty::<Order>("o1", &set_status("ready")).unwrap();

        let err = engine.push_local_changes().await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized));
        assert!(store.get_row::<Order>("o1").unwrap().unwrap().meta.needs_sync);
    }

    #[tokio::test]
    async fn test_new_message_is_replaced_by_server_record() {
        let api = Arc::new(FakeApi::new());
        let (engine, store, _network) = engine_with(api.clone(), true);
        let local = message("local-1", "t1", "Your phone is ready");
        store.insert_local(&local).unwrap();

        let report = engine.push_local_changes().await.unwrap();
        assert_eq!(report.pushed, 1);

        let sent = api.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "t1");
        assert_eq!(sent[0].1["content"], "Your phone is ready");

        assert!(store.get::<TicketMessage>("local-1").unwrap().is_none());
        let server = store.get_row::<TicketMessage>("srv-1").unwrap().unwrap();
        assert!(!server.meta.needs_sync);
        assert_eq!(server.record.content, "Your phone is ready");
        assert_eq!(server.record.sender_type, SenderType::Staff);
    }

    #[tokio::test]
    async fn test_push_order_is_orders_devices_messages() {
        let api = Arc::new(FakeApi::new());
        let (engine, store, _network) = engine_with(api.clone(), true);
        store.insert_local(&message("local-1", "t1", "hi")).unwrap();
        store.upsert(&device("d1", "o1", DeviceStatus::Diagnosing)).unwrap();
        store.mark_dirty::<Device>("d1", &set_status("repairing")).unwrap();
        store.upsert(&order("o1", OrderStatus::BookedIn)).unwrap();
        store.mark_dirty::<Order>("o1", &set_status("in_progress")).unwrap();

        engine.push_local_changes().await.unwrap();
        assert_eq!(
            api.call_log(),
            vec!["update orders/o1", "update devices/d1", "send t1"]
        );
    }
}
