//! Conversion between API wire records, domain entities and SQLite rows.
//!
//! Everything here is pure. Wire decoding is forgiving in the same places the
//! server is inconsistent: money arrives as a string or a number, timestamps
//! as ISO-8601 or SQLite `YYYY-MM-DD HH:MM:SS`, booleans as `0/1`, and
//! references either flat (`client_id`) or nested (`client: { id }`).
//! Money never passes through a float.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::Row;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

use crate::error::StoreError;
use crate::models::{
    Client, Device, DeviceStatus, EntityKind, Order, OrderStatus, SenderType, Ticket,
    TicketMessage, TicketStatus,
};

// ---------------------------------------------------------------------------
// Scalar normalisation
// ---------------------------------------------------------------------------

/// Parse a money value from the wire. `null` and blank strings are `None`.
pub fn parse_wire_decimal(value: &Value) -> Result<Option<Decimal>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            Decimal::from_str(trimmed)
                .or_else(|_| Decimal::from_scientific(trimmed))
                .map(Some)
                .map_err(|e| format!("invalid decimal {trimmed:?}: {e}"))
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(Some(Decimal::from(i)));
            }
            // serde_json prints the shortest representation that round-trips,
            // so 12.3 stays 12.3 instead of its binary expansion.
            let repr = n.to_string();
            Decimal::from_str(&repr)
                .or_else(|_| Decimal::from_scientific(&repr))
                .map(Some)
                .map_err(|e| format!("invalid decimal {repr}: {e}"))
        }
        other => Err(format!("expected decimal, got {other}")),
    }
}

/// Parse a timestamp from the wire: RFC 3339 first, then the SQLite
/// datetime format (assumed UTC), then a bare date.
pub fn parse_wire_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Storage format for timestamps: fixed-width UTC RFC 3339 so that text
/// ordering in SQLite matches chronological ordering.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Deserialisers for the inconsistent wire shapes.
mod wire {
    use super::*;
    use serde::de::Error as _;

    pub fn opt_decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Decimal>, D::Error> {
        let value = Value::deserialize(d)?;
        parse_wire_decimal(&value).map_err(D::Error::custom)
    }

    pub fn decimal_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
        opt_decimal(d).map(Option::unwrap_or_default)
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_wire_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp {raw:?}")))
    }

    pub fn opt_timestamp<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => parse_wire_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp {raw:?}"))),
        }
    }

    /// Integers sometimes arrive quoted.
    pub fn int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        match Value::deserialize(d)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| D::Error::custom(format!("invalid integer {n}"))),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| D::Error::custom(format!("invalid integer {s:?}"))),
            Value::Null => Ok(0),
            other => Err(D::Error::custom(format!("expected integer, got {other}"))),
        }
    }

    /// SQLite-backed endpoints send booleans as 0/1.
    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match Value::deserialize(d)? {
            Value::Bool(b) => Ok(b),
            Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
            Value::String(s) => Ok(matches!(s.trim(), "1" | "true" | "TRUE" | "True")),
            Value::Null => Ok(false),
            other => Err(D::Error::custom(format!("expected boolean, got {other}"))),
        }
    }

    /// Order notes are either plain text or a list of `{ body }` entries.
    pub fn notes<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            Value::Array(entries) => {
                let bodies: Vec<String> = entries
                    .iter()
                    .filter_map(|entry| match entry {
                        Value::String(s) => Some(s.clone()),
                        other => other.get("body").and_then(Value::as_str).map(str::to_string),
                    })
                    .filter(|s| !s.trim().is_empty())
                    .collect();
                Ok((!bodies.is_empty()).then(|| bodies.join("\n")))
            }
            other => Err(D::Error::custom(format!("unexpected notes shape {other}"))),
        }
    }
}

/// Nested `{ "id": ... }` reference used for client/location/assigned user.
#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OrderDto {
    id: String,
    #[serde(alias = "orderNumber", deserialize_with = "wire::int")]
    order_number: i64,
    #[serde(default)]
    status: Option<OrderStatus>,
    #[serde(default, alias = "order_total", alias = "orderTotal", deserialize_with = "wire::opt_decimal")]
    total: Option<Decimal>,
    #[serde(default, alias = "amount_paid", alias = "amountPaid", deserialize_with = "wire::opt_decimal")]
    deposit: Option<Decimal>,
    #[serde(default, alias = "balance_due", alias = "balanceDue", deserialize_with = "wire::opt_decimal")]
    balance: Option<Decimal>,
    #[serde(default, deserialize_with = "wire::notes")]
    notes: Option<String>,
    #[serde(default, alias = "clientId")]
    client_id: Option<String>,
    #[serde(default)]
    client: Option<IdRef>,
    #[serde(default, alias = "locationId")]
    location_id: Option<String>,
    #[serde(default)]
    location: Option<IdRef>,
    #[serde(default, alias = "assignedUserId")]
    assigned_user_id: Option<String>,
    #[serde(default, alias = "assignedUser")]
    assigned_user: Option<IdRef>,
    #[serde(alias = "createdAt", deserialize_with = "wire::timestamp")]
    created_at: DateTime<Utc>,
    #[serde(default, alias = "updatedAt", deserialize_with = "wire::opt_timestamp")]
    updated_at: Option<DateTime<Utc>>,
}

impl From<OrderDto> for Order {
    fn from(dto: OrderDto) -> Self {
        Order {
            id: dto.id,
            order_number: dto.order_number,
            status: dto.status.unwrap_or_default(),
            total: dto.total,
            deposit: dto.deposit,
            balance: dto.balance,
            notes: dto.notes,
            client_id: dto
                .client_id
                .or(dto.client.map(|c| c.id))
                .unwrap_or_default(),
            location_id: dto.location_id.or(dto.location.map(|l| l.id)),
            assigned_user_id: dto.assigned_user_id.or(dto.assigned_user.map(|u| u.id)),
            created_at: dto.created_at,
            updated_at: dto.updated_at.unwrap_or(dto.created_at),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceDto {
    id: String,
    #[serde(default, alias = "orderId")]
    order_id: Option<String>,
    #[serde(default)]
    order: Option<IdRef>,
    #[serde(default, rename = "type", alias = "device_type", alias = "deviceType")]
    device_type: Option<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default, alias = "serial_number", alias = "serialNumber")]
    serial: Option<String>,
    #[serde(default)]
    imei: Option<String>,
    #[serde(default)]
    passcode: Option<String>,
    #[serde(default)]
    status: Option<DeviceStatus>,
    #[serde(default)]
    issue: Option<String>,
    #[serde(default)]
    diagnosis: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_decimal")]
    price: Option<Decimal>,
    #[serde(default, alias = "assignedUserId")]
    assigned_user_id: Option<String>,
    #[serde(default, alias = "assignedUser")]
    assigned_user: Option<IdRef>,
    #[serde(alias = "createdAt", deserialize_with = "wire::timestamp")]
    created_at: DateTime<Utc>,
    #[serde(default, alias = "updatedAt", deserialize_with = "wire::opt_timestamp")]
    updated_at: Option<DateTime<Utc>>,
}

impl From<DeviceDto> for Device {
    fn from(dto: DeviceDto) -> Self {
        Device {
            id: dto.id,
            order_id: dto.order_id.or(dto.order.map(|o| o.id)).unwrap_or_default(),
            device_type: dto.device_type,
            brand: dto.brand,
            model: dto.model,
            serial: dto.serial,
            imei: dto.imei,
            passcode: dto.passcode,
            status: dto.status.unwrap_or_default(),
            issue: dto.issue,
            diagnosis: dto.diagnosis,
            resolution: dto.resolution,
            price: dto.price,
            assigned_user_id: dto.assigned_user_id.or(dto.assigned_user.map(|u| u.id)),
            created_at: dto.created_at,
            updated_at: dto.updated_at.unwrap_or(dto.created_at),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ClientDto {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, alias = "firstName")]
    first_name: Option<String>,
    #[serde(default, alias = "lastName")]
    last_name: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    postcode: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default, alias = "orderCount", deserialize_with = "wire::int")]
    order_count: i64,
    #[serde(
        default,
        alias = "total_spend",
        alias = "totalSpend",
        alias = "totalSpent",
        deserialize_with = "wire::decimal_or_zero"
    )]
    total_spent: Decimal,
    #[serde(alias = "createdAt", deserialize_with = "wire::timestamp")]
    created_at: DateTime<Utc>,
    #[serde(default, alias = "updatedAt", deserialize_with = "wire::opt_timestamp")]
    updated_at: Option<DateTime<Utc>>,
}

impl From<ClientDto> for Client {
    fn from(dto: ClientDto) -> Self {
        Client {
            id: dto.id,
            email: dto.email.unwrap_or_default(),
            first_name: dto.first_name,
            last_name: dto.last_name,
            phone: dto.phone,
            company: dto.company,
            address: dto.address,
            city: dto.city,
            postcode: dto.postcode,
            notes: dto.notes,
            order_count: dto.order_count,
            total_spent: dto.total_spent,
            created_at: dto.created_at,
            updated_at: dto.updated_at.unwrap_or(dto.created_at),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TicketDto {
    id: String,
    #[serde(alias = "ticketNumber", deserialize_with = "wire::int")]
    ticket_number: i64,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    status: Option<TicketStatus>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default, alias = "clientId")]
    client_id: Option<String>,
    #[serde(default, alias = "clientEmail")]
    client_email: Option<String>,
    #[serde(default, alias = "clientName")]
    client_name: Option<String>,
    #[serde(default, alias = "assignedUserId")]
    assigned_user_id: Option<String>,
    #[serde(default, alias = "orderId")]
    order_id: Option<String>,
    #[serde(default, alias = "lastMessageAt", deserialize_with = "wire::opt_timestamp")]
    last_message_at: Option<DateTime<Utc>>,
    #[serde(alias = "createdAt", deserialize_with = "wire::timestamp")]
    created_at: DateTime<Utc>,
    #[serde(default, alias = "updatedAt", deserialize_with = "wire::opt_timestamp")]
    updated_at: Option<DateTime<Utc>>,
}

impl From<TicketDto> for Ticket {
    fn from(dto: TicketDto) -> Self {
        Ticket {
            id: dto.id,
            ticket_number: dto.ticket_number,
            subject: dto.subject.unwrap_or_default(),
            status: dto.status.unwrap_or_default(),
            priority: dto.priority,
            client_id: dto.client_id,
            client_email: dto.client_email,
            client_name: dto.client_name,
            assigned_user_id: dto.assigned_user_id,
            order_id: dto.order_id,
            last_message_at: dto.last_message_at,
            created_at: dto.created_at,
            updated_at: dto.updated_at.unwrap_or(dto.created_at),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TicketMessageDto {
    id: String,
    #[serde(alias = "ticketId")]
    ticket_id: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "senderType")]
    sender_type: Option<SenderType>,
    #[serde(default, alias = "senderName")]
    sender_name: Option<String>,
    #[serde(default, alias = "senderId")]
    sender_id: Option<String>,
    #[serde(default, alias = "isInternal", deserialize_with = "wire::flag")]
    is_internal: bool,
    #[serde(alias = "createdAt", deserialize_with = "wire::timestamp")]
    created_at: DateTime<Utc>,
}

impl From<TicketMessageDto> for TicketMessage {
    fn from(dto: TicketMessageDto) -> Self {
        TicketMessage {
            id: dto.id,
            ticket_id: dto.ticket_id,
            content: dto.content.unwrap_or_default(),
            sender_type: dto.sender_type.unwrap_or_default(),
            sender_name: dto.sender_name,
            sender_id: dto.sender_id,
            is_internal: dto.is_internal,
            created_at: dto.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-record decoding
// ---------------------------------------------------------------------------

/// Entities that have a wire representation.
pub trait WireRecord: Sized {
    type Dto: DeserializeOwned + Into<Self>;
}

impl WireRecord for Order {
    type Dto = OrderDto;
}
impl WireRecord for Device {
    type Dto = DeviceDto;
}
impl WireRecord for Client {
    type Dto = ClientDto;
}
impl WireRecord for Ticket {
    type Dto = TicketDto;
}
impl WireRecord for TicketMessage {
    type Dto = TicketMessageDto;
}

/// One record of a batch that could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    pub index: usize,
    pub id: Option<String>,
    pub error: String,
}

/// Result of decoding a page: the good records plus what was skipped.
#[derive(Debug, Clone)]
pub struct DecodeBatch<E> {
    pub records: Vec<E>,
    pub failures: Vec<DecodeFailure>,
}

impl<E> DecodeBatch<E> {
    pub fn total(&self) -> usize {
        self.records.len() + self.failures.len()
    }

    pub fn is_total_failure(&self) -> bool {
        self.records.is_empty() && !self.failures.is_empty()
    }
}

pub fn decode_record<E: WireRecord>(value: Value) -> Result<E, String> {
    serde_json::from_value::<E::Dto>(value)
        .map(Into::into)
        .map_err(|e| e.to_string())
}

/// Decode every record independently so one malformed record never blocks
/// the rest of the page.
pub fn decode_batch<E: WireRecord>(kind: EntityKind, values: Vec<Value>) -> DecodeBatch<E> {
    let mut records = Vec::with_capacity(values.len());
    let mut failures = Vec::new();

    for (index, value) in values.into_iter().enumerate() {
        let id = value.get("id").and_then(Value::as_str).map(str::to_string);
        match decode_record::<E>(value) {
            Ok(record) => records.push(record),
            Err(error) => {
                warn!(entity = %kind, index, id = ?id, error = %error, "skipping undecodable record");
                failures.push(DecodeFailure { index, id, error });
            }
        }
    }

    DecodeBatch { records, failures }
}

// ---------------------------------------------------------------------------
// Push payloads
// ---------------------------------------------------------------------------

/// Partial update sent for a dirty order.
pub fn order_update_payload(order: &Order) -> Value {
    let mut payload = serde_json::json!({ "notes": order.notes });
    with_known_status(&mut payload, order.status.as_str(), order.status.is_unknown());
    payload
}

/// Partial update sent for a dirty device.
pub fn device_update_payload(device: &Device) -> Value {
    let mut payload = serde_json::json!({
        "diagnosis": device.diagnosis,
        "resolution": device.resolution,
        "price": device.price.map(|p| p.to_string()),
    });
    with_known_status(&mut payload, device.status.as_str(), device.status.is_unknown());
    payload
}

/// A status this client does not recognise came from the server and was
/// never edited here, so it is left out of the update.
fn with_known_status(payload: &mut Value, status: &str, unknown: bool) {
    if unknown {
        return;
    }
    if let Value::Object(map) = payload {
        map.insert("status".to_string(), Value::String(status.to_string()));
    }
}

/// Body of the "create message" call for a locally written ticket message.
pub fn new_message_payload(message: &TicketMessage) -> Value {
    serde_json::json!({
        "content": message.content,
        "is_internal": message.is_internal,
    })
}

// ---------------------------------------------------------------------------
// SQLite row mapping
// ---------------------------------------------------------------------------

/// An entity stored in its own table. `COLUMNS` lists the data columns in
/// the order produced by `to_values`, starting with `id`; the sync metadata
/// columns are managed by the store.
pub trait TableRow: Sized + Clone + PartialEq + Send + Sync + 'static {
    const KIND: EntityKind;
    const COLUMNS: &'static [&'static str];
    /// Column stamped with the mutation time by `mark_dirty`.
    const TOUCH_COLUMN: Option<&'static str>;

    fn id(&self) -> &str;
    fn from_row(row: &Row<'_>) -> Result<Self, StoreError>;
    fn to_values(&self) -> Vec<SqlValue>;

    fn table() -> &'static str {
        Self::KIND.table()
    }

    fn has_column(column: &str) -> bool {
        Self::COLUMNS.contains(&column)
    }
}

pub(crate) fn text_value(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

pub(crate) fn opt_text_value(s: Option<&str>) -> SqlValue {
    s.map(text_value).unwrap_or(SqlValue::Null)
}

pub(crate) fn decimal_value(d: Option<&Decimal>) -> SqlValue {
    d.map(|d| SqlValue::Text(d.to_string()))
        .unwrap_or(SqlValue::Null)
}

pub(crate) fn timestamp_value(dt: &DateTime<Utc>) -> SqlValue {
    SqlValue::Text(format_timestamp(dt))
}

pub(crate) fn opt_timestamp_value(dt: Option<&DateTime<Utc>>) -> SqlValue {
    dt.map(timestamp_value).unwrap_or(SqlValue::Null)
}

fn read_text(row: &Row<'_>, column: &'static str) -> Result<String, StoreError> {
    Ok(row.get::<_, Option<String>>(column)?.unwrap_or_default())
}

fn read_opt_text(row: &Row<'_>, column: &'static str) -> Result<Option<String>, StoreError> {
    Ok(row.get::<_, Option<String>>(column)?)
}

fn read_int(row: &Row<'_>, column: &'static str) -> Result<i64, StoreError> {
    Ok(row.get::<_, Option<i64>>(column)?.unwrap_or(0))
}

fn read_opt_decimal(row: &Row<'_>, column: &'static str) -> Result<Option<Decimal>, StoreError> {
    match row.get::<_, Option<String>>(column)? {
        None => Ok(None),
        Some(raw) => Decimal::from_str(&raw)
            .map(Some)
            .map_err(|_| StoreError::Corrupt { column, value: raw }),
    }
}

pub(crate) fn read_opt_timestamp(
    row: &Row<'_>,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    match row.get::<_, Option<String>>(column)? {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| StoreError::Corrupt { column, value: raw }),
    }
}

fn read_timestamp(row: &Row<'_>, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    read_opt_timestamp(row, column)?.ok_or(StoreError::Corrupt {
        column,
        value: "NULL".to_string(),
    })
}

impl TableRow for Order {
    const KIND: EntityKind = EntityKind::Orders;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "order_number",
        "status",
        "total",
        "deposit",
        "balance",
        "notes",
        "client_id",
        "location_id",
        "assigned_user_id",
        "created_at",
        "updated_at",
    ];
    const TOUCH_COLUMN: Option<&'static str> = Some("updated_at");

    fn id(&self) -> &str {
        &self.id
    }

    fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        Ok(Order {
            id: read_text(row, "id")?,
            order_number: read_int(row, "order_number")?,
            status: OrderStatus::from_wire(&read_text(row, "status")?),
            total: read_opt_decimal(row, "total")?,
            deposit: read_opt_decimal(row, "deposit")?,
            balance: read_opt_decimal(row, "balance")?,
            notes: read_opt_text(row, "notes")?,
            client_id: read_text(row, "client_id")?,
            location_id: read_opt_text(row, "location_id")?,
            assigned_user_id: read_opt_text(row, "assigned_user_id")?,
            created_at: read_timestamp(row, "created_at")?,
            updated_at: read_timestamp(row, "updated_at")?,
        })
    }

    fn to_values(&self) -> Vec<SqlValue> {
        vec![
            text_value(&self.id),
            SqlValue::Integer(self.order_number),
            text_value(self.status.as_str()),
            decimal_value(self.total.as_ref()),
            decimal_value(self.deposit.as_ref()),
            decimal_value(self.balance.as_ref()),
            opt_text_value(self.notes.as_deref()),
            text_value(&self.client_id),
            opt_text_value(self.location_id.as_deref()),
            opt_text_value(self.assigned_user_id.as_deref()),
            timestamp_value(&self.created_at),
            timestamp_value(&self.updated_at),
        ]
    }
}

impl TableRow for Device {
    const KIND: EntityKind = EntityKind::Devices;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "order_id",
        "device_type",
        "brand",
        "model",
        "serial",
        "imei",
        "passcode",
        "status",
        "issue",
        "diagnosis",
        "resolution",
        "price",
        "assigned_user_id",
        "created_at",
        "updated_at",
    ];
    const TOUCH_COLUMN: Option<&'static str> = Some("updated_at");

    fn id(&self) -> &str {
        &self.id
    }

    fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        Ok(Device {
            id: read_text(row, "id")?,
            order_id: read_text(row, "order_id")?,
            device_type: read_opt_text(row, "device_type")?,
            brand: read_opt_text(row, "brand")?,
            model: read_opt_text(row, "model")?,
            serial: read_opt_text(row, "serial")?,
            imei: read_opt_text(row, "imei")?,
            passcode: read_opt_text(row, "passcode")?,
            status: DeviceStatus::from_wire(&read_text(row, "status")?),
            issue: read_opt_text(row, "issue")?,
            diagnosis: read_opt_text(row, "diagnosis")?,
            resolution: read_opt_text(row, "resolution")?,
            price: read_opt_decimal(row, "price")?,
            assigned_user_id: read_opt_text(row, "assigned_user_id")?,
            created_at: read_timestamp(row, "created_at")?,
            updated_at: read_timestamp(row, "updated_at")?,
        })
    }

    fn to_values(&self) -> Vec<SqlValue> {
        vec![
            text_value(&self.id),
            text_value(&self.order_id),
            opt_text_value(self.device_type.as_deref()),
            opt_text_value(self.brand.as_deref()),
            opt_text_value(self.model.as_deref()),
            opt_text_value(self.serial.as_deref()),
            opt_text_value(self.imei.as_deref()),
            opt_text_value(self.passcode.as_deref()),
            text_value(self.status.as_str()),
            opt_text_value(self.issue.as_deref()),
            opt_text_value(self.diagnosis.as_deref()),
            opt_text_value(self.resolution.as_deref()),
            decimal_value(self.price.as_ref()),
            opt_text_value(self.assigned_user_id.as_deref()),
            timestamp_value(&self.created_at),
            timestamp_value(&self.updated_at),
        ]
    }
}

impl TableRow for Client {
    const KIND: EntityKind = EntityKind::Clients;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "email",
        "first_name",
        "last_name",
        "phone",
        "company",
        "address",
        "city",
        "postcode",
        "notes",
        "order_count",
        "total_spent",
        "created_at",
        "updated_at",
    ];
    const TOUCH_COLUMN: Option<&'static str> = Some("updated_at");

    fn id(&self) -> &str {
        &self.id
    }

    fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        Ok(Client {
            id: read_text(row, "id")?,
            email: read_text(row, "email")?,
            first_name: read_opt_text(row, "first_name")?,
            last_name: read_opt_text(row, "last_name")?,
            phone: read_opt_text(row, "phone")?,
            company: read_opt_text(row, "company")?,
            address: read_opt_text(row, "address")?,
            city: read_opt_text(row, "city")?,
            postcode: read_opt_text(row, "postcode")?,
            notes: read_opt_text(row, "notes")?,
            order_count: read_int(row, "order_count")?,
            total_spent: read_opt_decimal(row, "total_spent")?.unwrap_or_default(),
            created_at: read_timestamp(row, "created_at")?,
            updated_at: read_timestamp(row, "updated_at")?,
        })
    }

    fn to_values(&self) -> Vec<SqlValue> {
        vec![
            text_value(&self.id),
            text_value(&self.email),
            opt_text_value(self.first_name.as_deref()),
            opt_text_value(self.last_name.as_deref()),
            opt_text_value(self.phone.as_deref()),
            opt_text_value(self.company.as_deref()),
            opt_text_value(self.address.as_deref()),
            opt_text_value(self.city.as_deref()),
            opt_text_value(self.postcode.as_deref()),
            opt_text_value(self.notes.as_deref()),
            SqlValue::Integer(self.order_count),
            decimal_value(Some(&self.total_spent)),
            timestamp_value(&self.created_at),
            timestamp_value(&self.updated_at),
        ]
    }
}

impl TableRow for Ticket {
    const KIND: EntityKind = EntityKind::Tickets;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "ticket_number",
        "subject",
        "status",
        "priority",
        "client_id",
        "client_email",
        "client_name",
        "assigned_user_id",
        "order_id",
        "last_message_at",
        "created_at",
        "updated_at",
    ];
    const TOUCH_COLUMN: Option<&'static str> = Some("updated_at");

    fn id(&self) -> &str {
        &self.id
    }

    fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        Ok(Ticket {
            id: read_text(row, "id")?,
            ticket_number: read_int(row, "ticket_number")?,
            subject: read_text(row, "subject")?,
            status: TicketStatus::from_wire(&read_text(row, "status")?),
            priority: read_opt_text(row, "priority")?,
            client_id: read_opt_text(row, "client_id")?,
            client_email: read_opt_text(row, "client_email")?,
            client_name: read_opt_text(row, "client_name")?,
            assigned_user_id: read_opt_text(row, "assigned_user_id")?,
            order_id: read_opt_text(row, "order_id")?,
            last_message_at: read_opt_timestamp(row, "last_message_at")?,
            created_at: read_timestamp(row, "created_at")?,
            updated_at: read_timestamp(row, "updated_at")?,
        })
    }

    fn to_values(&self) -> Vec<SqlValue> {
        vec![
            text_value(&self.id),
            SqlValue::Integer(self.ticket_number),
            text_value(&self.subject),
            text_value(self.status.as_str()),
            opt_text_value(self.priority.as_deref()),
            opt_text_value(self.client_id.as_deref()),
            opt_text_value(self.client_email.as_deref()),
            opt_text_value(self.client_name.as_deref()),
            opt_text_value(self.assigned_user_id.as_deref()),
            opt_text_value(self.order_id.as_deref()),
            opt_timestamp_value(self.last_message_at.as_ref()),
            timestamp_value(&self.created_at),
            timestamp_value(&self.updated_at),
        ]
    }
}

impl TableRow for TicketMessage {
    const KIND: EntityKind = EntityKind::TicketMessages;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "ticket_id",
        "content",
        "sender_type",
        "sender_name",
        "sender_id",
        "is_internal",
        "created_at",
    ];
    const TOUCH_COLUMN: Option<&'static str> = None;

    fn id(&self) -> &str {
        &self.id
    }

    fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        Ok(TicketMessage {
            id: read_text(row, "id")?,
            ticket_id: read_text(row, "ticket_id")?,
            content: read_text(row, "content")?,
            sender_type: SenderType::from_wire(&read_text(row, "sender_type")?),
            sender_name: read_opt_text(row, "sender_name")?,
            sender_id: read_opt_text(row, "sender_id")?,
            is_internal: read_int(row, "is_internal")? != 0,
            created_at: read_timestamp(row, "created_at")?,
        })
    }

    fn to_values(&self) -> Vec<SqlValue> {
        vec![
            text_value(&self.id),
            text_value(&self.ticket_id),
            text_value(&self.content),
            text_value(self.sender_type.as_str()),
            opt_text_value(self.sender_name.as_deref()),
            opt_text_value(self.sender_id.as_deref()),
            SqlValue::Integer(i64::from(self.is_internal)),
            timestamp_value(&self.created_at),
        ]
    }
}
