//! Backing-store client and query interception
//!
//! [`QueryClient`] is the query-builder surface workflows use: select, insert, update,
//! delete and upsert against named tables holding JSON rows. [`SqliteClient`] keeps the
//! rows in SQLite. [`InstrumentedClient`] wraps any client, timing every call, keeping a
//! registry of in-flight queries and feeding the execution ledger.

use crate::clock::{elapsed_ms, SharedClock};
use crate::error::{FlowProbeError, Result};
use crate::ledger::ExecutionLedger;
use crate::models::DbOperationKind;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Column -> required value equality filters
pub type Filters = Map<String, Value>;

/// Query-builder capability set over JSON rows
#[cfg_attr(test, mockall::automock)]
pub trait QueryClient: Send + Sync {
    /// Rows matching every filter, in insertion order
    fn select(&self, table: &str, filters: &Filters) -> Result<Vec<Value>>;

    /// Append rows; returns rows affected
    fn insert(&self, table: &str, rows: &[Value]) -> Result<u64>;

    /// Merge `patch` into every matching row; returns rows affected
    fn update(&self, table: &str, filters: &Filters, patch: &Value) -> Result<u64>;

    /// Delete matching rows (all rows for empty filters); returns rows affected
    fn delete(&self, table: &str, filters: &Filters) -> Result<u64>;

    /// Replace rows sharing `key_column` with an incoming row, insert the rest
    fn upsert(&self, table: &str, rows: &[Value], key_column: &str) -> Result<u64>;

    /// Empty `tables` and load `rows` in one atomic unit; returns rows loaded
    fn replace_tables(&self, tables: &[String], rows: &BTreeMap<String, Vec<Value>>)
        -> Result<u64>;

    /// Number of matching rows
    fn count(&self, table: &str, filters: &Filters) -> Result<u64> {
        Ok(self.select(table, filters)?.len() as u64)
    }
}

/// Shared client handle
pub type SharedClient = Arc<dyn QueryClient>;

fn matches(row: &Value, filters: &Filters) -> bool {
    filters.iter().all(|(column, expected)| row.get(column) == Some(expected))
}

fn as_object(row: &Value) -> Result<&Map<String, Value>> {
    row.as_object()
        .ok_or_else(|| FlowProbeError::Other("rows must be JSON objects".to_string()))
}

/// SQLite-backed table store
///
/// Every table lives in one `rows` relation as serialized JSON, ordered by rowid.
#[derive(Clone)]
pub struct SqliteClient {
    conn: Arc<Mutex<Connection>>,
    tables: Arc<BTreeSet<String>>,
}

impl SqliteClient {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(path: P, tables: &[String]) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        Self::with_connection(conn, tables)
    }

    /// Create an in-memory database
    pub fn in_memory(tables: &[String]) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, tables)
    }

    fn with_connection(conn: Connection, tables: &[String]) -> Result<Self> {
        let client = Self {
            conn: Arc::new(Mutex::new(conn)),
            tables: Arc::new(tables.iter().cloned().collect()),
        };
        client.init_schema()?;
        Ok(client)
    }

    fn init_schema(&self) -> Result<()> {
        self.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rows_table ON rows(table_name, id);
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_table(&self, table: &str) -> Result<()> {
        if self.tables.contains(table) {
            Ok(())
        } else {
            Err(FlowProbeError::UnknownTable(table.to_string()))
        }
    }

    /// Managed table names
    pub fn tables(&self) -> Vec<String> {
        self.tables.iter().cloned().collect()
    }

    fn load_rows(conn: &Connection, table: &str) -> Result<Vec<(i64, Value)>> {
        let mut stmt =
            conn.prepare("SELECT id, data FROM rows WHERE table_name = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![table], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, data) = row?;
            out.push((id, serde_json::from_str(&data)?));
        }
        Ok(out)
    }

    fn insert_row(conn: &Connection, table: &str, row: &Value) -> Result<()> {
        as_object(row)?;
        conn.execute(
            "INSERT INTO rows (table_name, data) VALUES (?1, ?2)",
            params![table, row.to_string()],
        )?;
        Ok(())
    }
}

fn merge(target: &mut Value, patch: &Map<String, Value>) {
    if let Some(obj) = target.as_object_mut() {
        for (k, v) in patch {
            obj.insert(k.clone(), v.clone());
        }
    }
}

impl QueryClient for SqliteClient {
    fn select(&self, table: &str, filters: &Filters) -> Result<Vec<Value>> {
        self.check_table(table)?;
        let conn = self.lock();
        Ok(Self::load_rows(&conn, table)?
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| matches(row, filters))
            .collect())
    }

    fn insert(&self, table: &str, rows: &[Value]) -> Result<u64> {
        self.check_table(table)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for row in rows {
            Self::insert_row(&tx, table, row)?;
        }
        tx.commit()?;
        Ok(rows.len() as u64)
    }

    fn update(&self, table: &str, filters: &Filters, patch: &Value) -> Result<u64> {
        self.check_table(table)?;
        let patch = as_object(patch)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut affected = 0;
        for (id, mut row) in Self::load_rows(&tx, table)? {
            if matches(&row, filters) {
                merge(&mut row, patch);
                tx.execute(
                    "UPDATE rows SET data = ?1 WHERE id = ?2",
                    params![row.to_string(), id],
                )?;
                affected += 1;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    fn delete(&self, table: &str, filters: &Filters) -> Result<u64> {
        self.check_table(table)?;
        let mut conn = self.lock();
        if filters.is_empty() {
            let affected = conn.execute("DELETE FROM rows WHERE table_name = ?1", params![table])?;
            return Ok(affected as u64);
        }
        let tx = conn.transaction()?;
        let mut affected = 0;
        for (id, row) in Self::load_rows(&tx, table)? {
            if matches(&row, filters) {
                tx.execute("DELETE FROM rows WHERE id = ?1", params![id])?;
                affected += 1;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    fn upsert(&self, table: &str, rows: &[Value], key_column: &str) -> Result<u64> {
        self.check_table(table)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for row in rows {
            let incoming = as_object(row)?;
            let existing = match incoming.get(key_column) {
                Some(key) => Self::load_rows(&tx, table)?
                    .into_iter()
                    .find(|(_, r)| r.get(key_column) == Some(key)),
                None => None,
            };
            match existing {
                Some((id, mut current)) => {
                    merge(&mut current, incoming);
                    tx.execute(
                        "UPDATE rows SET data = ?1 WHERE id = ?2",
                        params![current.to_string(), id],
                    )?;
                }
                None => Self::insert_row(&tx, table, row)?,
            }
        }
        tx.commit()?;
        Ok(rows.len() as u64)
    }

    fn replace_tables(&self, tables: &[String], rows: &BTreeMap<String, Vec<Value>>) -> Result<u64> {
        for table in tables.iter().chain(rows.keys()) {
            self.check_table(table)?;
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for table in tables {
            tx.execute("DELETE FROM rows WHERE table_name = ?1", params![table])?;
        }
        let mut loaded = 0;
        for (table, table_rows) in rows {
            for row in table_rows {
                Self::insert_row(&tx, table, row)?;
                loaded += 1;
            }
        }
        tx.commit()?;
        Ok(loaded)
    }
}

/// A query the interceptor has started but not yet seen finish
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingQuery {
    pub id: u64,
    pub table: String,
    pub operation: DbOperationKind,
    pub started_at: DateTime<Utc>,
    /// Filled in by [`InFlightQueries::slower_than`]
    #[serde(default)]
    pub elapsed_ms: u64,
}

/// Registry of queries currently executing through an interceptor
#[derive(Clone)]
pub struct InFlightQueries {
    clock: SharedClock,
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, PendingQuery>>>,
}

impl InFlightQueries {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingQuery>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a query as started; returns its registry id
    pub fn begin(&self, table: &str, operation: DbOperationKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            id,
            PendingQuery {
                id,
                table: table.to_string(),
                operation,
                started_at: self.clock.now(),
                elapsed_ms: 0,
            },
        );
        id
    }

    /// Remove a finished query; returns how long it ran
    pub fn finish(&self, id: u64) -> u64 {
        let now = self.clock.now();
        self.lock()
            .remove(&id)
            .map(|q| elapsed_ms(q.started_at, now))
            .unwrap_or(0)
    }

    /// In-flight queries running longer than `threshold_ms`, oldest first
    pub fn slower_than(&self, threshold_ms: u64) -> Vec<PendingQuery> {
        let now = self.clock.now();
        let mut slow: Vec<PendingQuery> = self
            .lock()
            .values()
            .filter_map(|q| {
                let elapsed = elapsed_ms(q.started_at, now);
                (elapsed > threshold_ms).then(|| PendingQuery {
                    elapsed_ms: elapsed,
                    ..q.clone()
                })
            })
            .collect();
        slow.sort_by_key(|q| q.started_at);
        slow
    }

    /// Register a unit of work that stays in flight until the ticket is dropped
    pub fn ticket(&self, table: &str, operation: DbOperationKind) -> InFlightTicket {
        InFlightTicket {
            id: self.begin(table, operation),
            registry: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration returned by [`InFlightQueries::ticket`]
pub struct InFlightTicket {
    registry: InFlightQueries,
    id: u64,
}

impl Drop for InFlightTicket {
    fn drop(&mut self) {
        self.registry.finish(self.id);
    }
}

/// Ledger attribution for intercepted queries
#[derive(Clone)]
pub struct LedgerTap {
    pub ledger: Arc<ExecutionLedger>,
    pub step_id: String,
}

/// Timing decorator around a [`QueryClient`]
#[derive(Clone)]
pub struct InstrumentedClient {
    inner: SharedClient,
    in_flight: InFlightQueries,
    tap: Option<LedgerTap>,
}

impl InstrumentedClient {
    pub fn new(inner: SharedClient, in_flight: InFlightQueries, tap: Option<LedgerTap>) -> Self {
        Self {
            inner,
            in_flight,
            tap,
        }
    }

    fn intercept<T>(
        &self,
        operation: DbOperationKind,
        table: &str,
        params: Option<Value>,
        run: impl FnOnce(&dyn QueryClient) -> Result<T>,
        summarize: impl Fn(&T) -> (Option<Value>, u64),
    ) -> Result<T> {
        let registry_id = self.in_flight.begin(table, operation);
        let op_id = self.tap.as_ref().map(|tap| {
            tap.ledger.track_database_operation(
                &tap.step_id,
                operation,
                table,
                &format!("{} {}", operation, table),
                params,
            )
        });

        let outcome = run(self.inner.as_ref());
        let elapsed = self.in_flight.finish(registry_id);

        match &outcome {
            Ok(value) => {
                let (result, rows) = summarize(value);
                debug!(table, operation = %operation, rows, elapsed_ms = elapsed, "Query completed");
                if let (Some(tap), Some(op_id)) = (&self.tap, &op_id) {
                    tap.ledger
                        .complete_database_operation(op_id, result, Some(rows), None);
                }
            }
            Err(e) => {
                debug!(table, operation = %operation, error = %e, elapsed_ms = elapsed, "Query failed");
                if let (Some(tap), Some(op_id)) = (&self.tap, &op_id) {
                    tap.ledger
                        .complete_database_operation(op_id, None, None, Some(e.to_string()));
                }
            }
        }
        outcome
    }
}

fn affected(rows: &u64) -> (Option<Value>, u64) {
    (None, *rows)
}

impl QueryClient for InstrumentedClient {
    fn select(&self, table: &str, filters: &Filters) -> Result<Vec<Value>> {
        self.intercept(
            DbOperationKind::Select,
            table,
            Some(Value::Object(filters.clone())),
            |c| c.select(table, filters),
            |rows| (Some(Value::Array(rows.clone())), rows.len() as u64),
        )
    }

    fn insert(&self, table: &str, rows: &[Value]) -> Result<u64> {
        self.intercept(
            DbOperationKind::Insert,
            table,
            Some(Value::Array(rows.to_vec())),
            |c| c.insert(table, rows),
            affected,
        )
    }

    fn update(&self, table: &str, filters: &Filters, patch: &Value) -> Result<u64> {
        self.intercept(
            DbOperationKind::Update,
            table,
            Some(serde_json::json!({"filters": filters, "patch": patch})),
            |c| c.update(table, filters, patch),
            affected,
        )
    }

    fn delete(&self, table: &str, filters: &Filters) -> Result<u64> {
        self.intercept(
            DbOperationKind::Delete,
            table,
            Some(Value::Object(filters.clone())),
            |c| c.delete(table, filters),
            affected,
        )
    }

    fn upsert(&self, table: &str, rows: &[Value], key_column: &str) -> Result<u64> {
        self.intercept(
            DbOperationKind::Upsert,
            table,
            Some(serde_json::json!({"rows": rows, "on_conflict": key_column})),
            |c| c.upsert(table, rows, key_column),
            affected,
        )
    }

    fn replace_tables(&self, tables: &[String], rows: &BTreeMap<String, Vec<Value>>) -> Result<u64> {
        self.inner.replace_tables(tables, rows)
    }
}
