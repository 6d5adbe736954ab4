use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::{CachedTable, ListState};
use crate::error::RepositoryError;
use crate::models::{SenderType, Ticket, TicketMessage, TicketStatus};
use crate::store::Query;
use crate::sync::{LocalChange, SyncEngine, SyncEntityType};

/// Tickets and their conversations. Messages are published separately for
/// the ticket currently open in the UI.
pub struct TicketRepository {
    tickets: CachedTable<Ticket>,
    messages: CachedTable<TicketMessage>,
}

impl TicketRepository {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            tickets: CachedTable::new(engine.clone(), Some(SyncEntityType::Tickets)),
            messages: CachedTable::new(engine, None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ListState<Ticket>> {
        self.tickets.list().subscribe()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<ListState<TicketMessage>> {
        self.messages.list().subscribe()
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.tickets.list().items()
    }

    pub fn messages(&self) -> Vec<TicketMessage> {
        self.messages.list().items()
    }

    /// Most recent conversation first.
    pub async fn fetch_tickets(
        &self,
        status: Option<TicketStatus>,
    ) -> Result<Vec<Ticket>, RepositoryError> {
        let mut query = Query::new();
        if let Some(status) = status {
            query = query.eq("status", status.as_str().to_string());
        }
        self.tickets.fetch(by_activity(query)).await
    }

    pub async fn fetch_open_tickets(&self) -> Result<Vec<Ticket>, RepositoryError> {
        self.fetch_tickets(Some(TicketStatus::Open)).await
    }

    pub async fn fetch_pending_tickets(&self) -> Result<Vec<Ticket>, RepositoryError> {
        self.fetch_tickets(Some(TicketStatus::Pending)).await
    }

    pub async fn fetch_ticket(&self, id: &str) -> Result<Option<Ticket>, RepositoryError> {
        self.tickets.fetch_one(id).await
    }

    /// A ticket's messages, oldest first, refreshed from the server when
    /// online.
    pub async fn fetch_messages(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<TicketMessage>, RepositoryError> {
        let query = Query::new()
            .eq("ticket_id", ticket_id.to_string())
            .oldest_first("created_at");
        let engine = self.messages.engine();
        self.messages
            .fetch_with(query, || engine.pull_ticket_messages(ticket_id))
            .await
    }

    /// Write a staff message locally and send it when possible. The returned
    /// message carries a temporary id until the server's record replaces it.
    pub async fn send_message(
        &self,
        ticket_id: &str,
        content: &str,
        is_internal: bool,
    ) -> Result<TicketMessage, RepositoryError> {
        let message = TicketMessage {
            id: Uuid::new_v4().to_string(),
            ticket_id: ticket_id.to_string(),
            content: content.to_string(),
            sender_type: SenderType::Staff,
            sender_name: None,
            sender_id: None,
            is_internal,
            created_at: Utc::now(),
        };
        self.messages.store().insert_local(&message)?;
        debug!(ticket_id, id = %message.id, "message written locally");

        self.messages
            .engine()
            .queue_change(&LocalChange::TicketMessageCreated {
                id: message.id.clone(),
            });
        self.messages.reload_logged();

        self.messages.push_now().await;
        self.messages.reload_logged();
        Ok(message)
    }
}

fn by_activity(query: Query) -> Query {
    query
        .newest_first("last_message_at")
        .newest_first("created_at")
}
