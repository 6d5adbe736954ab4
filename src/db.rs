//! Local SQLite database layer for the repair shop cache.
//!
//! Uses rusqlite with WAL mode. A single writer connection serialises every
//! mutation (pull upserts, dirty marking, push bookkeeping) while a separate
//! read-only connection serves UI reads, so a long sync write never blocks a
//! list refresh. Provides schema migrations and the `local_settings` helpers.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::error::StoreError;

/// Owner of the SQLite connections.
pub struct DbState {
    writer: Mutex<Connection>,
    /// `None` for in-memory databases, where reads share the writer.
    reader: Option<Mutex<Connection>>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

impl DbState {
    /// Open (or create) the database at `path` and run pending migrations.
    ///
    /// There is no recovery path here: a store that cannot be opened is a
    /// fatal startup error for the host app.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|source| StoreError::Directory {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }

        info!("Opening local store at {}", path.display());

        let writer = open_writer(path)?;
        run_migrations(&writer)?;
        let reader = open_reader(path)?;

        info!("Local store initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
            db_path: path.to_path_buf(),
        })
    }

    /// Fresh in-memory database, used by tests and previews.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;

        Ok(Self {
            writer: Mutex::new(conn),
            reader: None,
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Lock the writer connection. All mutations go through here.
    pub fn writer(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.writer.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Lock the read connection (the writer for in-memory databases).
    pub fn reader(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        match &self.reader {
            Some(reader) => reader.lock().map_err(|_| StoreError::LockPoisoned),
            None => self.writer(),
        }
    }
}

fn open_writer(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(conn)
}

fn open_reader(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA query_only = ON;",
    )
    .map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Local store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating local store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: entity tables, sync flags and settings.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'unknown',
            total TEXT,
            deposit TEXT,
            balance TEXT,
            notes TEXT,
            client_id TEXT NOT NULL DEFAULT '',
            location_id TEXT,
            assigned_user_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            needs_sync INTEGER NOT NULL DEFAULT 0,
            synced_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_orders_needs_sync ON orders(needs_sync);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_client_id ON orders(client_id);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);

        -- order_id is a plain reference; orphaned devices are tolerated
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL DEFAULT '',
            device_type TEXT,
            brand TEXT,
            model TEXT,
            serial TEXT,
            imei TEXT,
            passcode TEXT,
            status TEXT NOT NULL DEFAULT 'unknown',
            issue TEXT,
            diagnosis TEXT,
            resolution TEXT,
            price TEXT,
            assigned_user_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            needs_sync INTEGER NOT NULL DEFAULT 0,
            synced_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_devices_needs_sync ON devices(needs_sync);
        CREATE INDEX IF NOT EXISTS idx_devices_order_id ON devices(order_id);
        CREATE INDEX IF NOT EXISTS idx_devices_status ON devices(status);
        CREATE INDEX IF NOT EXISTS idx_devices_assigned_user_id ON devices(assigned_user_id);

        CREATE TABLE IF NOT EXISTS clients (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL DEFAULT '',
            first_name TEXT,
            last_name TEXT,
            phone TEXT,
            company TEXT,
            address TEXT,
            city TEXT,
            postcode TEXT,
            notes TEXT,
            order_count INTEGER NOT NULL DEFAULT 0,
            total_spent TEXT NOT NULL DEFAULT '0',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            needs_sync INTEGER NOT NULL DEFAULT 0,
            synced_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_clients_needs_sync ON clients(needs_sync);
        CREATE INDEX IF NOT EXISTS idx_clients_email ON clients(email);
        CREATE INDEX IF NOT EXISTS idx_clients_updated_at ON clients(updated_at);

        CREATE TABLE IF NOT EXISTS tickets (
            id TEXT PRIMARY KEY,
            ticket_number INTEGER NOT NULL DEFAULT 0,
            subject TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'unknown',
            priority TEXT,
            client_id TEXT,
            client_email TEXT,
            client_name TEXT,
            assigned_user_id TEXT,
            order_id TEXT,
            last_message_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            needs_sync INTEGER NOT NULL DEFAULT 0,
            synced_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tickets_needs_sync ON tickets(needs_sync);
        CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
        CREATE INDEX IF NOT EXISTS idx_tickets_last_message_at ON tickets(last_message_at);

        CREATE TABLE IF NOT EXISTS ticket_messages (
            id TEXT PRIMARY KEY,
            ticket_id TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            sender_type TEXT NOT NULL DEFAULT 'unknown',
            sender_name TEXT,
            sender_id TEXT,
            is_internal INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            needs_sync INTEGER NOT NULL DEFAULT 0,
            synced_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_ticket_messages_needs_sync ON ticket_messages(needs_sync);
        CREATE INDEX IF NOT EXISTS idx_ticket_messages_ticket_id ON ticket_messages(ticket_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|source| {
        error!("Migration v1 failed: {source}");
        StoreError::Migration { version: 1, source }
    })?;

    info!("Applied migration v1 (entity tables)");
    Ok(())
}

/// Migration v2: push attempt bookkeeping so rejected edits stop retrying.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        ALTER TABLE orders ADD COLUMN sync_attempts INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE orders ADD COLUMN last_sync_error TEXT;
        ALTER TABLE devices ADD COLUMN sync_attempts INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE devices ADD COLUMN last_sync_error TEXT;
        ALTER TABLE clients ADD COLUMN sync_attempts INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE clients ADD COLUMN last_sync_error TEXT;
        ALTER TABLE tickets ADD COLUMN sync_attempts INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE tickets ADD COLUMN last_sync_error TEXT;
        ALTER TABLE ticket_messages ADD COLUMN sync_attempts INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE ticket_messages ADD COLUMN last_sync_error TEXT;

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|source| {
        error!("Migration v2 failed: {source}");
        StoreError::Migration { version: 2, source }
    })?;

    info!("Applied migration v2 (push attempt tracking)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(
    conn: &Connection,
    category: &str,
    key: &str,
) -> Result<Option<String>, StoreError> {
    let value = conn
        .query_row(
            "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn index_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND tbl_name = ?1")
            .expect("prepare index list");
        stmt.query_map([table], |row| row.get(0))
            .expect("query indexes")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_entity_tables() {
        let db = DbState::open_in_memory().expect("open");
        let conn = db.writer().unwrap();
        let tables = table_names(&conn);

        for table in [
            "local_settings",
            "orders",
            "devices",
            "clients",
            "tickets",
            "ticket_messages",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_pending_scan_and_foreign_key_indexes_exist() {
        let db = DbState::open_in_memory().expect("open");
        let conn = db.writer().unwrap();

        assert!(index_names(&conn, "devices").contains(&"idx_devices_order_id".to_string()));
        assert!(index_names(&conn, "ticket_messages")
            .contains(&"idx_ticket_messages_ticket_id".to_string()));
        for table in ["orders", "devices", "clients", "tickets", "ticket_messages"] {
            let expected = format!("idx_{table}_needs_sync");
            assert!(
                index_names(&conn, table).contains(&expected),
                "missing {expected}"
            );
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = DbState::open_in_memory().expect("open");
        let conn = db.writer().unwrap();
        run_migrations(&conn).expect("second run should be a no-op");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_settings_roundtrip_and_overwrite() {
        let db = DbState::open_in_memory().expect("open");
        let conn = db.writer().unwrap();

        assert_eq!(get_setting(&conn, "sync", "last_sync_date").unwrap(), None);
        set_setting(&conn, "sync", "last_sync_date", "2026-02-04T10:00:00Z").unwrap();
        set_setting(&conn, "sync", "last_sync_date", "2026-02-05T10:00:00Z").unwrap();
        assert_eq!(
            get_setting(&conn, "sync", "last_sync_date").unwrap().as_deref(),
            Some("2026-02-05T10:00:00Z")
        );
    }

    #[test]
    fn test_file_backed_store_uses_separate_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        let db = DbState::open(&path).expect("open file store");

        {
            let writer = db.writer().unwrap();
            set_setting(&writer, "sync", "k", "v").unwrap();
        }
        let reader = db.reader().unwrap();
        assert_eq!(get_setting(&reader, "sync", "k").unwrap().as_deref(), Some("v"));
        assert!(reader
            .execute("DELETE FROM local_settings", [])
            .is_err());

        let journal: String = db
            .writer()
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");
    }
}
