//! Domain entities mirrored from the repair shop API.
//!
//! Each entity is the UI-facing shape. Local sync metadata lives beside it in
//! [`SyncMeta`] rather than inside it, so the same struct is used for rows
//! read from the store and for records fetched directly from the server.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// String-backed enum. Unrecognised wire values are kept verbatim in
/// `Unknown` instead of failing the whole record, so they round-trip through
/// the store unchanged.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $variant:ident => $wire:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $variant, )+
            Unknown(String),
        }

        impl $name {
            /// Every known variant (excludes `Unknown`).
            pub const ALL: &'static [$name] = &[$( $name::$variant, )+];

            pub fn as_str(&self) -> &str {
                match self {
                    $( $name::$variant => $wire, )+
                    $name::Unknown(raw) => raw,
                }
            }

            pub fn from_wire(raw: &str) -> Self {
                let raw = raw.trim();
                match raw.to_ascii_lowercase().as_str() {
                    $( $wire => $name::$variant, )+
                    _ => $name::Unknown(raw.to_string()),
                }
            }

            pub fn is_unknown(&self) -> bool {
                matches!(self, $name::Unknown(_))
            }
        }

        impl Default for $name {
            /// A record that arrived without this field.
            fn default() -> Self {
                $name::Unknown(String::new())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Ok($name::from_wire(&raw))
            }
        }
    };
}

wire_enum! {
    /// Order lifecycle. The last group are legacy values older orders still carry.
    pub enum OrderStatus {
        AwaitingDevice => "awaiting_device",
        InProgress => "in_progress",
        ServiceComplete => "service_complete",
        AwaitingCollection => "awaiting_collection",
        CollectedDespatched => "collected_despatched",
        BookedIn => "booked_in",
        AwaitingParts => "awaiting_parts",
        Ready => "ready",
        Collected => "collected",
        Cancelled => "cancelled",
        Complete => "complete",
    }
}

impl OrderStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::AwaitingDevice
                | OrderStatus::InProgress
                | OrderStatus::ServiceComplete
                | OrderStatus::AwaitingCollection
                | OrderStatus::BookedIn
                | OrderStatus::AwaitingParts
                | OrderStatus::Ready
        )
    }

    pub fn active() -> Vec<OrderStatus> {
        Self::ALL.iter().filter(|s| s.is_active()).cloned().collect()
    }
}

wire_enum! {
    /// Per-device workflow status covering both repair and buyback flows.
    pub enum DeviceStatus {
        DeviceReceived => "device_received",
        Diagnosing => "diagnosing",
        ReadyToQuote => "ready_to_quote",
        CompanyRejected => "company_rejected",
        AwaitingAuthorisation => "awaiting_authorisation",
        Rejected => "rejected",
        RejectionQc => "rejection_qc",
        RejectionReady => "rejection_ready",
        Collected => "collected",
        Despatched => "despatched",
        AuthorisedSourceParts => "authorised_source_parts",
        AuthorisedAwaitingParts => "authorised_awaiting_parts",
        ReadyToRepair => "ready_to_repair",
        Repairing => "repairing",
        AwaitingRevisedQuote => "awaiting_revised_quote",
        RepairedQc => "repaired_qc",
        RepairedReady => "repaired_ready",
        ReadyToPay => "ready_to_pay",
        PaymentMade => "payment_made",
        AddedToBuyback => "added_to_buyback",
    }
}

impl DeviceStatus {
    /// No further transitions happen after a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeviceStatus::Collected | DeviceStatus::Despatched | DeviceStatus::AddedToBuyback
        )
    }

    pub fn is_ready_for_collection(&self) -> bool {
        matches!(
            self,
            DeviceStatus::RepairedReady | DeviceStatus::PaymentMade | DeviceStatus::RejectionReady
        )
    }

    pub fn is_active_work(&self) -> bool {
        matches!(self, DeviceStatus::Diagnosing | DeviceStatus::Repairing)
    }

    /// Statuses shown in the active queue: everything not yet handed back.
    pub fn active() -> Vec<DeviceStatus> {
        Self::ALL
            .iter()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect()
    }
}

wire_enum! {
    pub enum TicketStatus {
        Open => "open",
        Pending => "pending",
        Resolved => "resolved",
        Closed => "closed",
    }
}

wire_enum! {
    pub enum SenderType {
        Staff => "staff",
        Client => "client",
    }
}

/// The five locally cached tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Orders,
    Devices,
    Clients,
    Tickets,
    TicketMessages,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Orders,
        EntityKind::Devices,
        EntityKind::Clients,
        EntityKind::Tickets,
        EntityKind::TicketMessages,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Orders => "orders",
            EntityKind::Devices => "devices",
            EntityKind::Clients => "clients",
            EntityKind::Tickets => "tickets",
            EntityKind::TicketMessages => "ticket_messages",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: String,
    pub order_number: i64,
    pub status: OrderStatus,
    pub total: Option<Decimal>,
    pub deposit: Option<Decimal>,
    pub balance: Option<Decimal>,
    pub notes: Option<String>,
    pub client_id: String,
    pub location_id: Option<String>,
    pub assigned_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn display_ref(&self) -> String {
        format!("#{}", self.order_number)
    }

    pub fn is_paid(&self) -> bool {
        self.balance.unwrap_or_default() <= Decimal::ZERO
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: String,
    pub order_id: String,
    pub device_type: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub imei: Option<String>,
    pub passcode: Option<String>,
    pub status: DeviceStatus,
    pub issue: Option<String>,
    pub diagnosis: Option<String>,
    pub resolution: Option<String>,
    pub price: Option<Decimal>,
    pub assigned_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn display_name(&self) -> String {
        let parts: Vec<&str> = [self.brand.as_deref(), self.model.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            self.device_type.clone().unwrap_or_else(|| "Device".to_string())
        } else {
            parts.join(" ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Client {
    pub id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postcode: Option<String>,
    pub notes: Option<String>,
    pub order_count: i64,
    pub total_spent: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn full_name(&self) -> String {
        [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Name when known, email otherwise.
    pub fn display_name(&self) -> String {
        let name = self.full_name();
        if name.is_empty() {
            self.email.clone()
        } else {
            name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticket {
    pub id: String,
    pub ticket_number: i64,
    pub subject: String,
    pub status: TicketStatus,
    pub priority: Option<String>,
    pub client_id: Option<String>,
    pub client_email: Option<String>,
    pub client_name: Option<String>,
    pub assigned_user_id: Option<String>,
    pub order_id: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketMessage {
    pub id: String,
    pub ticket_id: String,
    pub content: String,
    pub sender_type: SenderType,
    pub sender_name: Option<String>,
    pub sender_id: Option<String>,
    pub is_internal: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-row local sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncMeta {
    /// Locally mutated and not yet pushed.
    pub needs_sync: bool,
    /// Last successful reconciliation with the server.
    pub synced_at: Option<DateTime<Utc>>,
    /// Failed push attempts since the row last went clean.
    pub sync_attempts: u32,
    pub last_sync_error: Option<String>,
}

/// A row read from the local store: the entity plus its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow<E> {
    pub record: E,
    pub meta: SyncMeta,
}
