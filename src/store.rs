//! Local store operations over the entity tables.
//!
//! Every write to an entity table goes through this type so the dirty-flag
//! rules cannot be bypassed:
//!
//! - `upsert` never touches a row with `needs_sync = 1` (local change wins),
//!   and an identical re-upsert of a clean row writes nothing.
//! - `mark_dirty` is the only way to change fields locally.
//! - `mark_clean` / `mark_pushed` clear the flag after a successful push.
//!
//! Reads go through the read connection, writes through the writer.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::error::StoreError;
use crate::mapper::{format_timestamp, read_opt_timestamp, TableRow};
use crate::models::{EntityKind, StoredRow, SyncMeta};

const SYNC_SETTINGS: &str = "sync";
const LAST_SYNC_DATE_KEY: &str = "last_sync_date";

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(&'static str, SqlValue),
    /// Matches any of the values. An empty list matches nothing.
    In(&'static str, Vec<SqlValue>),
    /// Case-insensitive substring match on any of the columns.
    Contains(Vec<&'static str>, String),
    NeedsSync(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: &'static str,
    pub descending: bool,
}

/// Predicate, ordering and limit for [`LocalStore::fetch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.filters.push(Filter::Eq(column, value.into()));
        self
    }

    pub fn any_of<V: Into<SqlValue>>(
        mut self,
        column: &'static str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filters.push(Filter::In(
            column,
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn contains(mut self, columns: &[&'static str], text: &str) -> Self {
        self.filters
            .push(Filter::Contains(columns.to_vec(), text.to_string()));
        self
    }

    pub fn needs_sync(mut self, dirty: bool) -> Self {
        self.filters.push(Filter::NeedsSync(dirty));
        self
    }

    pub fn newest_first(mut self, column: &'static str) -> Self {
        self.sort.push(SortKey {
            column,
            descending: true,
        });
        self
    }

    pub fn oldest_first(mut self, column: &'static str) -> Self {
        self.sort.push(SortKey {
            column,
            descending: false,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Build the SQL and its bound parameters for table `E`.
    fn to_sql<E: TableRow>(&self) -> Result<(String, Vec<SqlValue>), StoreError> {
        let table = E::table();
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        for filter in &self.filters {
            match filter {
                Filter::Eq(column, value) => {
                    check_column::<E>(*column)?;
                    params.push(value.clone());
                    clauses.push(format!("{column} = ?{}", params.len()));
                }
                Filter::In(column, values) => {
                    check_column::<E>(*column)?;
                    if values.is_empty() {
                        clauses.push("0".to_string());
                        continue;
                    }
                    let mut slots = Vec::with_capacity(values.len());
                    for value in values {
                        params.push(value.clone());
                        slots.push(format!("?{}", params.len()));
                    }
                    clauses.push(format!("{column} IN ({})", slots.join(", ")));
                }
                Filter::Contains(columns, text) => {
                    let needle = text.trim();
                    if needle.is_empty() {
                        continue;
                    }
                    params.push(SqlValue::Text(like_pattern(needle)));
                    let slot = params.len();
                    let mut any = Vec::with_capacity(columns.len());
                    for column in columns {
                        check_column::<E>(*column)?;
                        any.push(format!(
                            "LOWER(COALESCE({column}, '')) LIKE ?{slot} ESCAPE '\\'"
                        ));
                    }
                    if !any.is_empty() {
                        clauses.push(format!("({})", any.join(" OR ")));
                    }
                }
                Filter::NeedsSync(dirty) => {
                    clauses.push(format!("needs_sync = {}", i32::from(*dirty)));
                }
            }
        }

        let mut sql = format!("SELECT * FROM {table}");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if !self.sort.is_empty() {
            let keys = self
                .sort
                .iter()
                .map(|key| {
                    check_column::<E>(key.column)?;
                    Ok(format!(
                        "{} {}",
                        key.column,
                        if key.descending { "DESC" } else { "ASC" }
                    ))
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        Ok((sql, params))
    }
}

fn check_column<E: TableRow>(column: &'static str) -> Result<(), StoreError> {
    if E::has_column(column) {
        Ok(())
    } else {
        Err(StoreError::UnknownColumn {
            table: E::table(),
            column,
        })
    }
}

fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Incoming record identical to the stored clean row; nothing written.
    Unchanged,
    /// Stored row has unpushed local changes; incoming record ignored.
    SkippedDirty,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_dirty: usize,
}

impl UpsertSummary {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
            UpsertOutcome::SkippedDirty => self.skipped_dirty += 1,
        }
    }

    /// Rows actually written.
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushFailure {
    pub attempts: u32,
    /// The row is excluded from push scans until retried explicitly.
    pub parked: bool,
}

// ---------------------------------------------------------------------------
// LocalStore
// ---------------------------------------------------------------------------

/// Shared handle to the on-device cache. Cheap to clone.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<DbState>,
}

impl LocalStore {
    pub fn new(db: DbState) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        DbState::open(path).map(Self::new)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        DbState::open_in_memory().map(Self::new)
    }

    pub fn db_path(&self) -> &Path {
        &self.db.db_path
    }

    // -- reads --------------------------------------------------------------

    pub fn fetch<E: TableRow>(&self, query: &Query) -> Result<Vec<E>, StoreError> {
        let (sql, params) = query.to_sql::<E>()?;
        let conn = self.db.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(E::from_row(row)?);
        }
        Ok(out)
    }

    /// Like [`fetch`](Self::fetch) but with each row's sync metadata.
    pub fn fetch_rows<E: TableRow>(&self, query: &Query) -> Result<Vec<StoredRow<E>>, StoreError> {
        let (sql, params) = query.to_sql::<E>()?;
        let conn = self.db.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(StoredRow {
                record: E::from_row(row)?,
                meta: read_meta(row)?,
            });
        }
        Ok(out)
    }

    pub fn get<E: TableRow>(&self, id: &str) -> Result<Option<E>, StoreError> {
        Ok(self.get_row::<E>(id)?.map(|row| row.record))
    }

    pub fn get_row<E: TableRow>(&self, id: &str) -> Result<Option<StoredRow<E>>, StoreError> {
        let mut rows = self.fetch_rows::<E>(&Query::new().eq("id", id.to_string()).limit(1))?;
        Ok(rows.pop())
    }

    /// Dirty rows still eligible for a push attempt, oldest write first.
    pub fn pending<E: TableRow>(&self, max_attempts: u32) -> Result<Vec<E>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE needs_sync = 1 AND sync_attempts < ?1 ORDER BY rowid",
            E::table()
        );
        let conn = self.db.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![max_attempts])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(E::from_row(row)?);
        }
        Ok(out)
    }

    /// Dirty rows across all tables, including parked ones.
    pub fn count_pending(&self) -> Result<usize, StoreError> {
        let conn = self.db.reader()?;
        count_across(&conn, "needs_sync = 1", None)
    }

    /// Dirty rows that stopped being retried.
    pub fn count_failed(&self, max_attempts: u32) -> Result<usize, StoreError> {
        let conn = self.db.reader()?;
        count_across(
            &conn,
            "needs_sync = 1 AND sync_attempts >= ?1",
            Some(max_attempts),
        )
    }

    // -- guarded upsert -----------------------------------------------------

    pub fn upsert<E: TableRow>(&self, record: &E) -> Result<UpsertOutcome, StoreError> {
        let mut conn = self.db.writer()?;
        let tx = conn.transaction()?;
        let outcome = upsert_in(&tx, record, &format_timestamp(&Utc::now()))?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Apply a pulled page in server order inside one transaction.
    pub fn upsert_batch<E: TableRow>(&self, records: &[E]) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();
        if records.is_empty() {
            return Ok(summary);
        }

        let now = format_timestamp(&Utc::now());
        let mut conn = self.db.writer()?;
        let tx = conn.transaction()?;
        for record in records {
            summary.record(upsert_in(&tx, record, &now)?);
        }
        tx.commit()?;

        debug!(
            entity = %E::KIND,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            skipped_dirty = summary.skipped_dirty,
            "upserted batch"
        );
        Ok(summary)
    }

    // -- local mutation -----------------------------------------------------

    /// Write `fields` to the row and flag it for push. Returns `false` when
    /// no row with `id` exists.
    ///
    /// With no fields this only sets the flag, which is idempotent. A field
    /// change also stamps the touch column and gives a parked row a fresh set
    /// of push attempts.
    pub fn mark_dirty<E: TableRow>(
        &self,
        id: &str,
        fields: &[(&'static str, SqlValue)],
    ) -> Result<bool, StoreError> {
        let mut assignments = Vec::with_capacity(fields.len() + 4);
        let mut values = Vec::with_capacity(fields.len() + 2);

        for &(column, ref value) in fields {
            if column == "id" {
                return Err(StoreError::UnknownColumn {
                    table: E::table(),
                    column,
                });
            }
            check_column::<E>(column)?;
            values.push(value.clone());
            assignments.push(format!("{column} = ?{}", values.len()));
        }

        if !fields.is_empty() {
            if let Some(touch) = E::TOUCH_COLUMN {
                if !fields.iter().any(|(column, _)| *column == touch) {
                    values.push(SqlValue::Text(format_timestamp(&Utc::now())));
                    assignments.push(format!("{touch} = ?{}", values.len()));
                }
            }
            assignments.push("sync_attempts = 0".to_string());
            assignments.push("last_sync_error = NULL".to_string());
        }
        assignments.push("needs_sync = 1".to_string());

        values.push(SqlValue::Text(id.to_string()));
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            E::table(),
            assignments.join(", "),
            values.len()
        );

        let conn = self.db.writer()?;
        let changed = conn.execute(&sql, params_from_iter(values))?;
        if changed > 0 {
            debug!(entity = %E::KIND, id, fields = fields.len(), "marked dirty");
        }
        Ok(changed > 0)
    }

    /// Insert a row created locally (offline), already flagged for push.
    pub fn insert_local<E: TableRow>(&self, record: &E) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} ({}, needs_sync) VALUES ({}, 1)",
            E::table(),
            E::COLUMNS.join(", "),
            placeholders(E::COLUMNS.len())
        );
        let conn = self.db.writer()?;
        conn.execute(&sql, params_from_iter(record.to_values()))?;
        debug!(entity = %E::KIND, id = record.id(), "inserted local row");
        Ok(())
    }

    // -- push bookkeeping ---------------------------------------------------

    pub fn mark_clean(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {} SET needs_sync = 0, synced_at = ?1, sync_attempts = 0, last_sync_error = NULL
             WHERE id = ?2",
            kind.table()
        );
        let conn = self.db.writer()?;
        let changed = conn.execute(&sql, params![format_timestamp(&Utc::now()), id])?;
        Ok(changed > 0)
    }

    /// Clear the flag only if the row still holds the state that was pushed.
    /// A local edit made while the request was in flight keeps the row dirty.
    pub fn mark_pushed<E: TableRow>(&self, pushed: &E) -> Result<bool, StoreError> {
        let Some(touch) = E::TOUCH_COLUMN else {
            return self.mark_clean(E::KIND, pushed.id());
        };
        let Some(position) = E::COLUMNS.iter().position(|c| *c == touch) else {
            return self.mark_clean(E::KIND, pushed.id());
        };
        let stamp = pushed
            .to_values()
            .into_iter()
            .nth(position)
            .unwrap_or(SqlValue::Null);

        let sql = format!(
            "UPDATE {} SET needs_sync = 0, synced_at = ?1, sync_attempts = 0, last_sync_error = NULL
             WHERE id = ?2 AND {touch} = ?3",
            E::table()
        );
        let conn = self.db.writer()?;
        let changed = conn.execute(
            &sql,
            params![format_timestamp(&Utc::now()), pushed.id(), stamp],
        )?;
        if changed == 0 {
            debug!(entity = %E::KIND, id = pushed.id(), "row changed during push; left dirty");
        }
        Ok(changed > 0)
    }

    /// Count a failed push. The row stays dirty; it is parked when the error
    /// is permanent or the attempt ceiling is reached.
    pub fn record_push_failure(
        &self,
        kind: EntityKind,
        id: &str,
        error: &str,
        permanent: bool,
        max_attempts: u32,
    ) -> Result<PushFailure, StoreError> {
        let conn = self.db.writer()?;
        let sql = format!(
            "UPDATE {} SET
                sync_attempts = CASE WHEN ?1 THEN MAX(sync_attempts + 1, ?2) ELSE sync_attempts + 1 END,
                last_sync_error = ?3
             WHERE id = ?4 AND needs_sync = 1",
            kind.table()
        );
        conn.execute(&sql, params![permanent, max_attempts, error, id])?;

        let attempts: u32 = conn
            .query_row(
                &format!("SELECT sync_attempts FROM {} WHERE id = ?1", kind.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let parked = attempts >= max_attempts;
        if parked {
            warn!(entity = %kind, id, attempts, error, "parking local change after failed push");
        }
        Ok(PushFailure { attempts, parked })
    }

    /// Give every parked row a fresh set of push attempts.
    pub fn reset_push_attempts(&self) -> Result<usize, StoreError> {
        let conn = self.db.writer()?;
        let mut total = 0;
        for kind in EntityKind::ALL {
            total += conn.execute(
                &format!(
                    "UPDATE {} SET sync_attempts = 0, last_sync_error = NULL
                     WHERE needs_sync = 1 AND sync_attempts > 0",
                    kind.table()
                ),
                [],
            )?;
        }
        Ok(total)
    }

    /// Swap a local-only row for the record the server created from it.
    pub fn replace_local_row<E: TableRow>(
        &self,
        local_id: &str,
        server: &E,
    ) -> Result<(), StoreError> {
        let table = E::table();
        let updates = E::COLUMNS
            .iter()
            .skip(1)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO {table} ({}, needs_sync, synced_at) VALUES ({}, 0, ?{})
             ON CONFLICT(id) DO UPDATE SET {updates}, needs_sync = 0, synced_at = excluded.synced_at,
                sync_attempts = 0, last_sync_error = NULL",
            E::COLUMNS.join(", "),
            placeholders(E::COLUMNS.len()),
            E::COLUMNS.len() + 1
        );

        let mut values = server.to_values();
        values.push(SqlValue::Text(format_timestamp(&Utc::now())));

        let mut conn = self.db.writer()?;
        let tx = conn.transaction()?;
        if local_id != server.id() {
            tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![local_id])?;
        }
        tx.execute(&insert, params_from_iter(values))?;
        tx.commit()?;
        Ok(())
    }

    // -- maintenance --------------------------------------------------------

    /// Remove every row of one table. Logout/reset only.
    pub fn delete_all(&self, kind: EntityKind) -> Result<usize, StoreError> {
        let conn = self.db.writer()?;
        let deleted = conn.execute(&format!("DELETE FROM {}", kind.table()), [])?;
        info!(entity = %kind, deleted, "cleared local table");
        Ok(deleted)
    }

    /// Wipe all cached entities and sync settings.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut conn = self.db.writer()?;
        let tx = conn.transaction()?;
        for kind in EntityKind::ALL {
            tx.execute(&format!("DELETE FROM {}", kind.table()), [])?;
        }
        tx.execute(
            "DELETE FROM local_settings WHERE setting_category = ?1",
            params![SYNC_SETTINGS],
        )?;
        tx.commit()?;
        info!("local store reset");
        Ok(())
    }

    pub fn last_sync_date(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.db.reader()?;
        let Some(raw) = db::get_setting(&conn, SYNC_SETTINGS, LAST_SYNC_DATE_KEY)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(dt) => Ok(Some(dt.with_timezone(&Utc))),
            Err(_) => {
                warn!(value = %raw, "ignoring unreadable last sync date");
                Ok(None)
            }
        }
    }

    pub fn set_last_sync_date(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.db.writer()?;
        db::set_setting(
            &conn,
            SYNC_SETTINGS,
            LAST_SYNC_DATE_KEY,
            &format_timestamp(&at),
        )
    }
}

fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_meta(row: &Row<'_>) -> Result<SyncMeta, StoreError> {
    Ok(SyncMeta {
        needs_sync: row.get::<_, i64>("needs_sync")? != 0,
        synced_at: read_opt_timestamp(row, "synced_at")?,
        sync_attempts: row.get::<_, u32>("sync_attempts")?,
        last_sync_error: row.get("last_sync_error")?,
    })
}

fn count_across(
    conn: &Connection,
    condition: &str,
    bound: Option<u32>,
) -> Result<usize, StoreError> {
    let mut total = 0usize;
    for kind in EntityKind::ALL {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {condition}", kind.table());
        let count: i64 = match bound {
            Some(b) => conn.query_row(&sql, params![b], |row| row.get(0))?,
            None => conn.query_row(&sql, [], |row| row.get(0))?,
        };
        total += count as usize;
    }
    Ok(total)
}

/// Guarded insert-or-update of one record within an open transaction.
fn upsert_in<E: TableRow>(
    conn: &Connection,
    record: &E,
    now: &str,
) -> Result<UpsertOutcome, StoreError> {
    let table = E::table();
    let incoming = record.to_values();

    let existing = conn
        .query_row(
            &format!(
                "SELECT needs_sync, {} FROM {table} WHERE id = ?1",
                E::COLUMNS.join(", ")
            ),
            params![record.id()],
            |row| {
                let dirty: i64 = row.get(0)?;
                let values = (0..E::COLUMNS.len())
                    .map(|i| row.get::<_, SqlValue>(i + 1))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok((dirty != 0, values))
            },
        )
        .optional()?;

    match existing {
        None => {
            let sql = format!(
                "INSERT INTO {table} ({}, needs_sync, synced_at) VALUES ({}, 0, ?{})",
                E::COLUMNS.join(", "),
                placeholders(E::COLUMNS.len()),
                E::COLUMNS.len() + 1
            );
            let mut values = incoming;
            values.push(SqlValue::Text(now.to_string()));
            conn.execute(&sql, params_from_iter(values))?;
            Ok(UpsertOutcome::Inserted)
        }
        Some((true, _)) => {
            debug!(entity = %E::KIND, id = record.id(), "skipping pull for dirty row");
            Ok(UpsertOutcome::SkippedDirty)
        }
        Some((false, stored)) if stored == incoming => Ok(UpsertOutcome::Unchanged),
        Some((false, _)) => {
            let assignments = E::COLUMNS
                .iter()
                .enumerate()
                .skip(1)
                .map(|(i, c)| format!("{c} = ?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let n = E::COLUMNS.len();
            let sql = format!(
                "UPDATE {table} SET {assignments}, synced_at = ?{} WHERE id = ?1 AND needs_sync = 0",
                n + 1
            );
            let mut values = incoming;
            values.push(SqlValue::Text(now.to_string()));
            conn.execute(&sql, params_from_iter(values))?;
            Ok(UpsertOutcome::Updated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Client, Device, DeviceStatus, Order, OrderStatus, TicketMessage};
    use crate::test_support::fixtures::{client, device, message, order};
    use chrono::SubsecRound;

    fn store() -> LocalStore {
        LocalStore::open_in_memory().expect("open store")
    }

    fn raw_row(store: &LocalStore, id: &str) -> Vec<SqlValue> {
        let conn = store.db.reader().unwrap();
        conn.query_row("SELECT * FROM orders WHERE id = ?1", params![id], |row| {
            (0..row.as_ref().column_count())
                .map(|i| row.get::<_, SqlValue>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap()
    }

    #[test]
    fn test_identical_upsert_is_a_no_op() {
        let store = store();
        let o1 = order("o1", OrderStatus::BookedIn);

        assert_eq!(store.upsert(&o1).unwrap(), UpsertOutcome::Inserted);
        let before = raw_row(&store, "o1");
        assert_eq!(store.upsert(&o1).unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(raw_row(&store, "o1"), before);

        let all: Vec<Order> = store.fetch(&Query::new()).unwrap();
        assert_eq!(all, vec![o1]);
    }

    #[test]
    fn test_clean_row_takes_remote_changes() {
        let store = store();
        store.upsert(&order("o1", OrderStatus::BookedIn)).unwrap();

        let remote = order("o1", OrderStatus::Ready);
        assert_eq!(store.upsert(&remote).unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.get::<Order>("o1").unwrap(), Some(remote));
    }

    #[test]
    fn test_dirty_row_is_never_overwritten_by_pull() {
        let store = store();
        store.upsert(&order("o1", OrderStatus::BookedIn)).unwrap();
        assert!(store
            .mark_dirty::<Order>("o1", &[("status", SqlValue::from("in_progress".to_string()))])
            .unwrap());
        let before = raw_row(&store, "o1");

        let mut remote = order("o1", OrderStatus::Ready);
        remote.notes = Some("server notes".into());
        assert_eq!(store.upsert(&remote).unwrap(), UpsertOutcome::SkippedDirty);
        assert_eq!(raw_row(&store, "o1"), before);

        let summary = store.upsert_batch(&[remote, order("o2", OrderStatus::Ready)]).unwrap();
        assert_eq!(summary.skipped_dirty, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(raw_row(&store, "o1"), before);
    }

    #[test]
    fn test_guard_covers_clients_too() {
        let store = store();
        store.upsert(&client("c1", "Jo", "Bloggs", "jo@example.com")).unwrap();
        store
            .mark_dirty::<Client>("c1", &[("phone", SqlValue::from("07700 900000".to_string()))])
            .unwrap();

        let remote = client("c1", "Joanne", "Bloggs", "jo@example.com");
        assert_eq!(store.upsert(&remote).unwrap(), UpsertOutcome::SkippedDirty);
        let local = store.get::<Client>("c1").unwrap().unwrap();
        assert_eq!(local.first_name.as_deref(), Some("Jo"));
        assert_eq!(local.phone.as_deref(), Some("07700 900000"));
    }

    #[test]
    fn test_dirty_then_clean_cycle() {
        let store = store();
        store.upsert(&order("o1", OrderStatus::BookedIn)).unwrap();
        store
            .mark_dirty::<Order>("o1", &[("status", SqlValue::from("in_progress".to_string()))])
            .unwrap();

        let row = store.get_row::<Order>("o1").unwrap().unwrap();
        assert!(row.meta.needs_sync);
        assert_eq!(row.record.status, OrderStatus::InProgress);
        assert!(row.record.updated_at > order("o1", OrderStatus::BookedIn).updated_at);
        assert_eq!(store.count_pending().unwrap(), 1);

        let pushed_at = Utc::now().trunc_subsecs(6);
        assert!(store.mark_pushed(&row.record).unwrap());

        let row = store.get_row::<Order>("o1").unwrap().unwrap();
        assert!(!row.meta.needs_sync);
        assert!(row.meta.synced_at.unwrap() >= pushed_at);
        assert_eq!(store.count_pending().unwrap(), 0);
    }

    #[test]
    fn test_mark_pushed_keeps_edit_made_during_push() {
        let store = store();
        store.upsert(&device("d1", "o1", DeviceStatus::Diagnosing)).unwrap();
        store
            .mark_dirty::<Device>("d1", &[("diagnosis", SqlValue::from("Board fault".to_string()))])
            .unwrap();
        let in_flight = store.get::<Device>("d1").unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(2));
        store
            .mark_dirty::<Device>("d1", &[("diagnosis", SqlValue::from("Board + screen".to_string()))])
            .unwrap();

        assert!(!store.mark_pushed(&in_flight).unwrap());
        let row = store.get_row::<Device>("d1").unwrap().unwrap();
        assert!(row.meta.needs_sync);
        assert_eq!(row.record.diagnosis.as_deref(), Some("Board + screen"));
    }

    #[test]
    fn test_mark_dirty_missing_row_and_bad_column() {
        let store = store();
        assert!(!store.mark_dirty::<Order>("missing", &[]).unwrap());
        store.upsert(&order("o1", OrderStatus::BookedIn)).unwrap();
        assert!(matches!(
            store.mark_dirty::<Order>("o1", &[("needs_sync", SqlValue::Integer(0))]),
            Err(StoreError::UnknownColumn { .. })
        ));
        assert!(matches!(
            store.mark_dirty::<Order>("o1", &[("id", SqlValue::from("o2".to_string()))]),
            Err(StoreError::UnknownColumn { .. })
        ));
        // flag-only marking is idempotent
        assert!(store.mark_dirty::<Order>("o1", &[]).unwrap());
        assert!(store.mark_dirty::<Order>("o1", &[]).unwrap());
        assert_eq!(store.count_pending().unwrap(), 1);
    }

    #[test]
    fn test_push_failures_park_row_but_keep_it_dirty() {
        let store = store();
        store.upsert(&order("o1", OrderStatus::BookedIn)).unwrap();
        store.mark_dirty::<Order>("o1", &[]).unwrap();

        let first = store
            .record_push_failure(EntityKind::Orders, "o1", "timed out", false, 3)
            .unwrap();
        assert_eq!(first, PushFailure { attempts: 1, parked: false });
        assert_eq!(store.pending::<Order>(3).unwrap().len(), 1);

        let rejected = store
            .record_push_failure(EntityKind::Orders, "o1", "status is invalid", true, 3)
            .unwrap();
        assert!(rejected.parked);
        assert!(store.pending::<Order>(3).unwrap().is_empty());
        assert_eq!(store.count_failed(3).unwrap(), 1);

        let row = store.get_row::<Order>("o1").unwrap().unwrap();
        assert!(row.meta.needs_sync);
        assert_eq!(row.meta.last_sync_error.as_deref(), Some("status is invalid"));

        assert_eq!(store.reset_push_attempts().unwrap(), 1);
        assert_eq!(store.pending::<Order>(3).unwrap().len(), 1);
        assert_eq!(store.count_failed(3).unwrap(), 0);
    }

    #[test]
    fn test_push_failure_does_not_touch_synced_at() {
        let store = store();
        store.upsert(&order("o1", OrderStatus::BookedIn)).unwrap();
        let synced = store.get_row::<Order>("o1").unwrap().unwrap().meta.synced_at;
        store.mark_dirty::<Order>("o1", &[]).unwrap();
        store
            .record_push_failure(EntityKind::Orders, "o1", "server error", false, 10)
            .unwrap();
        let meta = store.get_row::<Order>("o1").unwrap().unwrap().meta;
        assert!(meta.needs_sync);
        assert_eq!(meta.synced_at, synced);
    }

    #[test]
    fn test_query_filters_and_ordering() {
        let store = store();
        let mut a = order("a", OrderStatus::BookedIn);
        a.created_at = a.created_at - chrono::Duration::days(2);
        let b = order("b", OrderStatus::Ready);
        let mut c = order("c", OrderStatus::Collected);
        c.created_at = c.created_at - chrono::Duration::days(1);
        store.upsert_batch(&[a, b, c]).unwrap();

        let active: Vec<Order> = store
            .fetch(
                &Query::new()
                    .any_of("status", ["booked_in".to_string(), "ready".to_string()])
                    .newest_first("created_at"),
            )
            .unwrap();
        let ids: Vec<&str> = active.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);

        let none: Vec<Order> = store
            .fetch(&Query::new().any_of("status", Vec::<String>::new()))
            .unwrap();
        assert!(none.is_empty());

        let newest: Vec<Order> = store
            .fetch(&Query::new().newest_first("created_at").limit(1))
            .unwrap();
        assert_eq!(newest[0].id, "b");

        assert!(matches!(
            store.fetch::<Order>(&Query::new().eq("colour", "red".to_string())),
            Err(StoreError::UnknownColumn { column: "colour", .. })
        ));
    }

    #[test]
    fn test_contains_is_case_insensitive_and_escaped() {
        let store = store();
        store
            .upsert_batch(&[
                client("c1", "Jo", "Bloggs", "jo@example.com"),
                client("c2", "Sam", "Smith", "sam_s@example.com"),
                client("c3", "Alex", "Jones", "alex@example.org"),
            ])
            .unwrap();

        let search = |text: &str| -> Vec<String> {
            store
                .fetch::<Client>(
                    &Query::new()
                        .contains(&["first_name", "last_name", "email", "phone"], text)
                        .oldest_first("id"),
                )
                .unwrap()
                .into_iter()
                .map(|c| c.id)
                .collect()
        };

        assert_eq!(search("BLOGGS"), ["c1"]);
        assert_eq!(search("example.com"), ["c1", "c2"]);
        assert_eq!(search("_s@"), ["c2"]);
        assert_eq!(search("%"), Vec::<String>::new());
        assert_eq!(search("  ").len(), 3);
    }

    #[test]
    fn test_local_message_replaced_by_server_record() {
        let store = store();
        let local = message("local-1", "t1", "On its way");
        store.insert_local(&local).unwrap();
        assert_eq!(store.pending::<TicketMessage>(10).unwrap().len(), 1);

        let server = message("m-900", "t1", "On its way");
        store.replace_local_row("local-1", &server).unwrap();

        let rows = store
            .fetch_rows::<TicketMessage>(&Query::new().eq("ticket_id", "t1".to_string()))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.id, "m-900");
        assert!(!rows[0].meta.needs_sync);
        assert!(rows[0].meta.synced_at.is_some());
    }

    #[test]
    fn test_delete_all_and_reset() {
        let store = store();
        store.upsert(&order("o1", OrderStatus::BookedIn)).unwrap();
        store.upsert(&device("d1", "o1", DeviceStatus::Repairing)).unwrap();
        store.set_last_sync_date(Utc::now()).unwrap();

        assert_eq!(store.delete_all(EntityKind::Orders).unwrap(), 1);
        assert!(store.get::<Order>("o1").unwrap().is_none());
        assert!(store.get::<Device>("d1").unwrap().is_some());

        store.reset().unwrap();
        assert!(store.get::<Device>("d1").unwrap().is_none());
        assert_eq!(store.last_sync_date().unwrap(), None);
    }

    #[test]
    fn test_last_sync_date_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let at = Utc::now().trunc_subsecs(6);
        {
            let store = LocalStore::open(&path).unwrap();
            store.set_last_sync_date(at).unwrap();
        }
        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.last_sync_date().unwrap(), Some(at));
    }
}
