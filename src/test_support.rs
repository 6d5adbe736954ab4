//! Shared fixtures and an in-memory [`RemoteApi`] for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::api::{ListFilters, RemoteApi, Resource};
use crate::error::ApiError;
use crate::network::NetworkMonitor;
use crate::store::LocalStore;
use crate::sync::{SyncEngine, SyncSettings};

pub mod fixtures {
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::{json, Value};

    use crate::models::{
        Client, Device, DeviceStatus, Order, OrderStatus, SenderType, Ticket, TicketMessage,
        TicketStatus,
    };

    pub const BASE_TIME: &str = "2026-02-01T09:00:00Z";

    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap()
    }

    pub fn order(id: &str, status: OrderStatus) -> Order {
        Order {
            id: id.to_string(),
            order_number: 1000,
            status,
            total: Some(Decimal::new(12000, 2)),
            deposit: Some(Decimal::new(2000, 2)),
            balance: Some(Decimal::new(10000, 2)),
            notes: None,
            client_id: "c1".to_string(),
            location_id: None,
            assigned_user_id: None,
            created_at: base_time(),
            updated_at: base_time(),
        }
    }

    pub fn device(id: &str, order_id: &str, status: DeviceStatus) -> Device {
        Device {
            id: id.to_string(),
            order_id: order_id.to_string(),
            device_type: Some("phone".to_string()),
            brand: Some("Apple".to_string()),
            model: Some("iPhone 13".to_string()),
            serial: None,
            imei: None,
            passcode: None,
            status,
            issue: Some("Cracked screen".to_string()),
            diagnosis: None,
            resolution: None,
            price: None,
            assigned_user_id: None,
            created_at: base_time(),
            updated_at: base_time(),
        }
    }

    pub fn client(id: &str, first: &str, last: &str, email: &str) -> Client {
        Client {
            id: id.to_string(),
            email: email.to_string(),
            first_name: Some(first.to_string()),
            last_name: Some(last.to_string()),
            phone: None,
            company: None,
            address: None,
            city: None,
            postcode: None,
            notes: None,
            order_count: 1,
            total_spent: Decimal::ZERO,
            created_at: base_time(),
            updated_at: base_time(),
        }
    }

    pub fn ticket(id: &str, status: TicketStatus) -> Ticket {
        Ticket {
            id: id.to_string(),
            ticket_number: 500,
            subject: "Screen repair".to_string(),
            status,
            priority: None,
            client_id: Some("c1".to_string()),
            client_email: None,
            client_name: None,
            assigned_user_id: None,
            order_id: None,
            last_message_at: None,
            created_at: base_time(),
            updated_at: base_time(),
        }
    }

    pub fn message(id: &str, ticket_id: &str, content: &str) -> TicketMessage {
        TicketMessage {
            id: id.to_string(),
            ticket_id: ticket_id.to_string(),
            content: content.to_string(),
            sender_type: SenderType::Staff,
            sender_name: None,
            sender_id: None,
            is_internal: false,
            created_at: base_time(),
        }
    }

    pub fn order_json(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "order_number": 1000,
            "status": status,
            "order_total": "120.00",
            "amount_paid": 20,
            "balance_due": "100.00",
            "client": { "id": "c1" },
            "created_at": BASE_TIME,
            "updated_at": BASE_TIME,
        })
    }

    pub fn device_json(id: &str, order_id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "order_id": order_id,
            "type": "phone",
            "brand": "Apple",
            "model": "iPhone 13",
            "status": status,
            "created_at": BASE_TIME,
        })
    }

    pub fn client_json(id: &str) -> Value {
        json!({
            "id": id,
            "email": format!("{id}@example.com"),
            "first_name": "Jo",
            "last_name": "Bloggs",
            "order_count": "2",
            "total_spend": 150.5,
            "created_at": BASE_TIME,
        })
    }

    pub fn ticket_json(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "ticket_number": 500,
            "subject": "Screen repair",
            "status": status,
            "created_at": BASE_TIME,
        })
    }

    pub fn message_json(id: &str, ticket_id: &str) -> Value {
        json!({
            "id": id,
            "ticket_id": ticket_id,
            "content": format!("message {id}"),
            "sender_type": "client",
            "is_internal": 0,
            "created_at": BASE_TIME,
        })
    }
}

/// Scripted [`RemoteApi`]. Unconfigured lists are empty, unconfigured
/// records are `NotFound`, and every call is logged.
#[derive(Default)]
pub struct FakeApi {
    lists: Mutex<HashMap<Resource, Vec<Value>>>,
    records: Mutex<HashMap<(Resource, String), Value>>,
    messages: Mutex<HashMap<String, Vec<Value>>>,
    list_failures: Mutex<HashMap<Resource, ApiError>>,
    update_failures: Mutex<HashMap<String, ApiError>>,
    all_updates_fail: Mutex<Option<ApiError>>,
    updates: Mutex<Vec<(Resource, String, Value)>>,
    sent: Mutex<Vec<(String, Value)>>,
    last_filters: Mutex<Option<ListFilters>>,
    log: Mutex<Vec<String>>,
    list_gate: Mutex<Option<Arc<Semaphore>>>,
    list_calls: AtomicUsize,
    update_calls: AtomicUsize,
    next_message: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_list(&self, resource: Resource, items: Vec<Value>) {
        self.lists.lock().unwrap().insert(resource, items);
    }

    pub fn set_record(&self, resource: Resource, id: &str, value: Value) {
        self.records
            .lock()
            .unwrap()
            .insert((resource, id.to_string()), value);
    }

    pub fn set_messages(&self, ticket_id: &str, items: Vec<Value>) {
        self.messages
            .lock()
            .unwrap()
            .insert(ticket_id.to_string(), items);
    }

    pub fn fail_list(&self, resource: Resource, err: ApiError) {
        self.list_failures.lock().unwrap().insert(resource, err);
    }

    pub fn fail_update(&self, id: &str, err: ApiError) {
        self.update_failures
            .lock()
            .unwrap()
            .insert(id.to_string(), err);
    }

    pub fn fail_all_updates(&self, err: ApiError) {
        *self.all_updates_fail.lock().unwrap() = Some(err);
    }

    pub fn clear_failures(&self) {
        self.list_failures.lock().unwrap().clear();
        self.update_failures.lock().unwrap().clear();
        *self.all_updates_fail.lock().unwrap() = None;
    }

    /// Block every `list` call until permits are added to the returned gate.
    pub fn hold_lists(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.list_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Successful updates, in call order.
    pub fn updates(&self) -> Vec<(Resource, String, Value)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn sent_messages(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_list_filters(&self) -> Option<ListFilters> {
        self.last_filters.lock().unwrap().clone()
    }

    pub fn call_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Update attempts, failed ones included.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn record_call(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn list(
        &self,
        resource: Resource,
        _page: u32,
        _limit: u32,
        filters: &ListFilters,
    ) -> Result<Vec<Value>, ApiError> {
        self.record_call(format!("list {resource}"));
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_filters.lock().unwrap() = Some(filters.clone());

        let gate = self.list_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.map_err(|_| ApiError::Offline)?;
        }

        if let Some(err) = self.list_failures.lock().unwrap().get(&resource) {
            return Err(err.clone());
        }
        Ok(self
            .lists
            .lock()
            .unwrap()
            .get(&resource)
            .cloned()
            .unwrap_or_default())
    }

    async fn get(&self, resource: Resource, id: &str) -> Result<Value, ApiError> {
        self.record_call(format!("get {resource}/{id}"));
        self.records
            .lock()
            .unwrap()
            .get(&(resource, id.to_string()))
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn update(&self, resource: Resource, id: &str, body: Value) -> Result<(), ApiError> {
        self.record_call(format!("update {resource}/{id}"));
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.all_updates_fail.lock().unwrap().clone() {
            return Err(err);
        }
        if let Some(err) = self.update_failures.lock().unwrap().get(id) {
            return Err(err.clone());
        }
        self.updates
            .lock()
            .unwrap()
            .push((resource, id.to_string(), body));
        Ok(())
    }

    async fn create(&self, resource: Resource, mut body: Value) -> Result<Value, ApiError> {
        self.record_call(format!("create {resource}"));
        body["id"] = json!(format!("new-{}", self.next_message.fetch_add(1, Ordering::SeqCst) + 1));
        Ok(body)
    }

    async fn list_ticket_messages(&self, ticket_id: &str) -> Result<Vec<Value>, ApiError> {
        self.record_call(format!("messages {ticket_id}"));
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(ticket_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_ticket_message(&self, ticket_id: &str, body: Value) -> Result<Value, ApiError> {
        self.record_call(format!("send {ticket_id}"));
        if let Some(err) = self.all_updates_fail.lock().unwrap().clone() {
            return Err(err);
        }
        let n = self.next_message.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent
            .lock()
            .unwrap()
            .push((ticket_id.to_string(), body.clone()));
        Ok(json!({
            "id": format!("srv-{n}"),
            "ticket_id": ticket_id,
            "content": body["content"],
            "is_internal": body["is_internal"],
            "sender_type": "staff",
            "created_at": Utc::now().to_rfc3339(),
        }))
    }
}

/// Settings with short delays so tests do not wait on production timings.
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        completed_reset_delay: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
        ..SyncSettings::default()
    }
}

pub fn engine_with(api: Arc<FakeApi>, online: bool) -> (SyncEngine, LocalStore, NetworkMonitor) {
    engine_with_settings(api, online, fast_settings())
}

pub fn engine_with_settings(
    api: Arc<FakeApi>,
    online: bool,
    settings: SyncSettings,
) -> (SyncEngine, LocalStore, NetworkMonitor) {
    let store = LocalStore::open_in_memory().unwrap();
    let network = NetworkMonitor::new(online);
    let engine = SyncEngine::new(store.clone(), api, network.clone(), settings);
    (engine, store, network)
}
