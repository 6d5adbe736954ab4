use tokio::sync::watch;

use super::{CachedTable, ListState};
use crate::error::RepositoryError;
use crate::models::Client;
use crate::store::Query;
use crate::sync::{SyncEngine, SyncEntityType};

const SEARCH_COLUMNS: [&str; 4] = ["first_name", "last_name", "email", "phone"];

pub struct ClientRepository {
    table: CachedTable<Client>,
}

impl ClientRepository {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            table: CachedTable::new(engine, Some(SyncEntityType::Clients)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ListState<Client>> {
        self.table.list().subscribe()
    }

    pub fn clients(&self) -> Vec<Client> {
        self.table.list().items()
    }

    pub async fn fetch_clients(&self) -> Result<Vec<Client>, RepositoryError> {
        self.table
            .fetch(Query::new().newest_first("created_at"))
            .await
    }

    /// The `limit` most recently updated clients.
    pub async fn fetch_recent_clients(&self, limit: usize) -> Result<Vec<Client>, RepositoryError> {
        let query = Query::new().newest_first("updated_at").limit(limit);
        self.table.fetch(query).await
    }

    /// Local substring match on name, email and phone. When online the
    /// server is searched too and its matches are cached before the local
    /// re-read.
    pub async fn search_clients(&self, text: &str) -> Result<Vec<Client>, RepositoryError> {
        let text = text.trim();
        if text.is_empty() {
            return self.fetch_clients().await;
        }
        let query = Query::new()
            .contains(&SEARCH_COLUMNS, text)
            .newest_first("updated_at");
        let engine = self.table.engine();
        self.table
            .fetch_with(query, || engine.search_clients(text))
            .await
    }

    pub async fn fetch_client(&self, id: &str) -> Result<Option<Client>, RepositoryError> {
        self.table.fetch_one(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::api::Resource;
    use crate::test_support::fixtures::{client, client_json};
    use crate::test_support::{engine_with, FakeApi};

    #[tokio::test]
    async fn test_search_matches_locally_when_offline() {
        let api = Arc::new(FakeApi::new());
        let (engine, store, _network) = engine_with(api.clone(), false);
        let repo = ClientRepository::new(engine);
        let mut sam = client("c2", "Sam", "Smith", "sam@example.com");
        sam.phone = Some("07700 900123".into());
        store
            .upsert_batch(&[client("c1", "Jo", "Bloggs", "jo@example.com"), sam])
            .unwrap();

        let found = repo.search_clients("SMI").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "c2");
        assert_eq!(repo.search_clients("900123").await.unwrap()[0].id, "c2");
        assert_eq!(repo.search_clients("  ").await.unwrap().len(), 2);
        assert_eq!(api.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_online_search_enriches_cache() {
        let api = Arc::new(FakeApi::new());
        api.set_list(Resource::Clients, vec![client_json("c9")]);
        let (engine, store, _network) = engine_with(api.clone(), true);
        let repo = ClientRepository::new(engine);

        let found = repo.search_clients("bloggs").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].email, "c9@example.com");
        assert!(store.get::<Client>("c9").unwrap().is_some());
        assert_eq!(api.last_list_filters().unwrap().search.as_deref(), Some("bloggs"));
    }

    #[tokio::test]
    async fn test_recent_clients_respects_limit() {
        let api = Arc::new(FakeApi::new());
        let (engine, store, _network) = engine_with(api, false);
        let repo = ClientRepository::new(engine);
        let mut newer = client("c2", "Sam", "Smith", "sam@example.com");
        newer.updated_at = newer.updated_at + chrono::Duration::hours(1);
        store
            .upsert_batch(&[client("c1", "Jo", "Bloggs", "jo@example.com"), newer])
            .unwrap();

        let recent = repo.fetch_recent_clients(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "c2");
        assert!(repo.fetch_client("c1").await.unwrap().is_some());
    }
}
