//! Environment switch: production/test backing stores and table snapshots
//!
//! Exactly one backing store is active at a time. Snapshots capture every row of every
//! managed table, live in memory for the process lifetime and are persisted through an
//! [`ArtifactStore`](crate::persist::ArtifactStore) so they survive restarts.

use crate::clock::SharedClock;
use crate::config::DatabaseConfig;
use crate::error::{FlowProbeError, Result};
use crate::ledger::ExecutionLedger;
use crate::persist::SharedStore;
use crate::store::{
    Filters, InFlightQueries, InstrumentedClient, LedgerTap, PendingQuery, SharedClient,
    SqliteClient,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the snapshot `reset_to_clean_state` looks for
pub const CLEAN_STATE_SNAPSHOT: &str = "clean_state";

/// Active backing store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DbMode {
    Production,
    Test,
}

impl std::fmt::Display for DbMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbMode::Production => write!(f, "production"),
            DbMode::Test => write!(f, "test"),
        }
    }
}

impl DbMode {
    pub fn from_use_test_db(use_test_db: bool) -> Self {
        if use_test_db {
            DbMode::Test
        } else {
            DbMode::Production
        }
    }
}

/// Aggregate figures of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    /// Serialized JSON length of all table dumps
    pub size_bytes: usize,
    pub table_count: usize,
    pub row_count: usize,
}

/// Point-in-time capture of every managed table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Mode the rows were captured from
    pub mode: DbMode,
    pub tables: BTreeMap<String, Vec<Value>>,
    pub metadata: SnapshotMetadata,
}

/// Listing entry for a snapshot, without its rows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: SnapshotMetadata,
}

impl From<&DatabaseSnapshot> for SnapshotInfo {
    fn from(s: &DatabaseSnapshot) -> Self {
        Self {
            id: s.id.clone(),
            name: s.name.clone(),
            description: s.description.clone(),
            created_at: s.created_at,
            metadata: s.metadata.clone(),
        }
    }
}

/// Opens the backing store of a mode
pub trait Connector: Send + Sync {
    fn connect(&self, mode: DbMode) -> Result<SharedClient>;
}

/// SQLite files at the configured production and test paths
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    production_path: PathBuf,
    test_path: PathBuf,
    tables: Vec<String>,
}

impl SqliteConnector {
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            production_path: config.production_path.clone(),
            test_path: config.test_path.clone(),
            tables: config.tables.clone(),
        }
    }
}

impl Connector for SqliteConnector {
    fn connect(&self, mode: DbMode) -> Result<SharedClient> {
        let (path, key) = match mode {
            DbMode::Production => (&self.production_path, "database.production_path"),
            DbMode::Test => (&self.test_path, "database.test_path"),
        };
        if path.as_os_str().is_empty() {
            return Err(FlowProbeError::Config(format!("{} is not set", key)));
        }
        Ok(Arc::new(SqliteClient::open(path, &self.tables)?))
    }
}

/// One in-memory SQLite database per mode, kept alive across reconnects
#[derive(Clone)]
pub struct MemoryConnector {
    production: SqliteClient,
    test: SqliteClient,
}

impl MemoryConnector {
    pub fn new(tables: &[String]) -> Result<Self> {
        Ok(Self {
            production: SqliteClient::in_memory(tables)?,
            test: SqliteClient::in_memory(tables)?,
        })
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, mode: DbMode) -> Result<SharedClient> {
        Ok(match mode {
            DbMode::Production => Arc::new(self.production.clone()),
            DbMode::Test => Arc::new(self.test.clone()),
        })
    }
}

struct Active {
    mode: DbMode,
    client: SharedClient,
}

/// Switches backing stores and manages table snapshots
pub struct EnvironmentSwitch {
    tables: Vec<String>,
    log_queries: bool,
    connector: Arc<dyn Connector>,
    active: Mutex<Active>,
    snapshots: Mutex<Vec<DatabaseSnapshot>>,
    snapshot_store: SharedStore,
    in_flight: InFlightQueries,
    clock: SharedClock,
}

impl EnvironmentSwitch {
    /// Connect the mode selected by `database.use_test_db`
    pub fn new(
        config: &DatabaseConfig,
        connector: Arc<dyn Connector>,
        snapshot_store: SharedStore,
        clock: SharedClock,
    ) -> Result<Self> {
        let mode = DbMode::from_use_test_db(config.use_test_db);
        let client = connector.connect(mode)?;
        info!(mode = %mode, tables = config.tables.len(), "Environment initialized");

        Ok(Self {
            tables: config.tables.clone(),
            log_queries: config.log_queries,
            connector,
            active: Mutex::new(Active { mode, client }),
            snapshots: Mutex::new(Vec::new()),
            snapshot_store,
            in_flight: InFlightQueries::new(clock.clone()),
            clock,
        })
    }

    fn active(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshots(&self) -> MutexGuard<'_, Vec<DatabaseSnapshot>> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> DbMode {
        self.active().mode
    }

    pub fn known_tables(&self) -> &[String] {
        &self.tables
    }

    /// Activate another backing store; no-op when already active
    pub fn switch_mode(&self, target: DbMode) -> Result<()> {
        let mut active = self.active();
        if active.mode == target {
            debug!(mode = %target, "Environment already active");
            return Ok(());
        }
        let client = self.connector.connect(target)?;
        info!(from = %active.mode, to = %target, "Switching environment");
        *active = Active {
            mode: target,
            client,
        };
        Ok(())
    }

    /// Unwrapped client of the active store
    pub fn raw_client(&self) -> SharedClient {
        self.active().client.clone()
    }

    /// Managed client; intercepted for timing when `log_queries` is on
    pub fn client(&self) -> SharedClient {
        let raw = self.raw_client();
        if self.log_queries {
            Arc::new(InstrumentedClient::new(raw, self.in_flight.clone(), None))
        } else {
            raw
        }
    }

    /// Client whose queries are recorded against a ledger step
    pub fn client_for_step(&self, ledger: Arc<ExecutionLedger>, step_id: &str) -> SharedClient {
        Arc::new(InstrumentedClient::new(
            self.raw_client(),
            self.in_flight.clone(),
            Some(LedgerTap {
                ledger,
                step_id: step_id.to_string(),
            }),
        ))
    }

    /// Number of rows in `table` matching `filters`
    pub fn count(&self, table: &str, filters: &Filters) -> Result<u64> {
        self.raw_client().count(table, filters)
    }

    /// Registry of queries and database steps currently running
    pub fn in_flight(&self) -> &InFlightQueries {
        &self.in_flight
    }

    /// In-flight intercepted queries already running longer than `threshold_ms`
    pub fn get_slow_queries(&self, threshold_ms: u64) -> Vec<PendingQuery> {
        self.in_flight.slower_than(threshold_ms)
    }

    /// Capture every managed table; returns the snapshot id
    pub fn create_snapshot(&self, name: &str, description: Option<&str>) -> Result<String> {
        let client = self.raw_client();
        let mut tables = BTreeMap::new();
        for table in &self.tables {
            tables.insert(table.clone(), client.select(table, &Filters::new())?);
        }

        let size_bytes = serde_json::to_vec(&tables)?.len();
        let row_count = tables.values().map(Vec::len).sum();
        let snapshot = DatabaseSnapshot {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: self.clock.now(),
            mode: self.mode(),
            metadata: SnapshotMetadata {
                size_bytes,
                table_count: tables.len(),
                row_count,
            },
            tables,
        };

        match serde_json::to_value(&snapshot) {
            Ok(value) => {
                if let Err(e) = self.snapshot_store.save(&snapshot.id, &value) {
                    warn!(snapshot_id = %snapshot.id, error = %e, "Failed to persist snapshot");
                }
            }
            Err(e) => warn!(snapshot_id = %snapshot.id, error = %e, "Failed to serialize snapshot"),
        }

        info!(
            snapshot_id = %snapshot.id,
            name,
            rows = row_count,
            bytes = size_bytes,
            "Snapshot created"
        );
        let id = snapshot.id.clone();
        self.snapshots().push(snapshot);
        Ok(id)
    }

    fn load_persisted(&self, id: &str) -> Option<DatabaseSnapshot> {
        match self.snapshot_store.load(id) {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(snapshot_id = id, error = %e, "Persisted snapshot is malformed");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(snapshot_id = id, error = %e, "Failed to read persisted snapshot");
                None
            }
        }
    }

    /// Find a snapshot in memory, falling back to durable storage
    pub fn get_snapshot(&self, id: &str) -> Option<DatabaseSnapshot> {
        if let Some(found) = self.snapshots().iter().find(|s| s.id == id) {
            return Some(found.clone());
        }
        let loaded = self.load_persisted(id)?;
        self.snapshots().push(loaded.clone());
        Some(loaded)
    }

    /// Delete every row of every managed table
    pub fn clear_all_tables(&self) -> Result<u64> {
        let client = self.raw_client();
        let mut removed = 0;
        for table in &self.tables {
            removed += client.delete(table, &Filters::new())?;
        }
        Ok(removed)
    }

    /// Replace the contents of every managed table with a snapshot's rows
    pub fn restore_snapshot(&self, id: &str) -> Result<()> {
        let snapshot = self
            .get_snapshot(id)
            .ok_or_else(|| FlowProbeError::SnapshotNotFound(id.to_string()))?;

        let mut rows = BTreeMap::new();
        for (table, table_rows) in snapshot.tables {
            if self.tables.contains(&table) {
                rows.insert(table, table_rows);
            } else {
                warn!(table = %table, snapshot_id = id, "Skipping table no longer managed");
            }
        }
        self.raw_client().replace_tables(&self.tables, &rows)?;

        info!(snapshot_id = id, name = %snapshot.name, "Snapshot restored");
        Ok(())
    }

    /// Restore the latest "clean_state" snapshot, or clear every table
    pub fn reset_to_clean_state(&self) -> Result<()> {
        let clean = self
            .list_snapshots()
            .into_iter()
            .filter(|s| s.name == CLEAN_STATE_SNAPSHOT)
            .max_by_key(|s| s.created_at);

        match clean {
            Some(info) => self.restore_snapshot(&info.id),
            None => {
                debug!("No clean_state snapshot, clearing tables");
                self.clear_all_tables().map(|_| ())
            }
        }
    }

    /// Every known snapshot, in memory and persisted, oldest first
    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        let mut by_id: HashMap<String, SnapshotInfo> = self
            .snapshots()
            .iter()
            .map(|s| (s.id.clone(), SnapshotInfo::from(s)))
            .collect();

        match self.snapshot_store.keys() {
            Ok(keys) => {
                for key in keys {
                    if by_id.contains_key(&key) {
                        continue;
                    }
                    if let Some(snapshot) = self.load_persisted(&key) {
                        by_id.insert(key, SnapshotInfo::from(&snapshot));
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list persisted snapshots"),
        }

        let mut listed: Vec<SnapshotInfo> = by_id.into_values().collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        listed
    }

    /// Forget a snapshot everywhere; returns false if it was unknown
    pub fn delete_snapshot(&self, id: &str) -> Result<bool> {
        let in_memory = {
            let mut snapshots = self.snapshots();
            let before = snapshots.len();
            snapshots.retain(|s| s.id != id);
            snapshots.len() != before
        };
        let persisted = self.snapshot_store.load(id)?.is_some();
        self.snapshot_store.remove(id)?;
        Ok(in_memory || persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::persist::{ArtifactStore, FileStore, MemoryStore};
    use serde_json::json;

    fn db_config() -> DatabaseConfig {
        DatabaseConfig {
            use_test_db: true,
            tables: vec!["projects".to_string(), "artifacts".to_string()],
            ..Default::default()
        }
    }

    fn switch_with(store: SharedStore) -> (EnvironmentSwitch, MockClock) {
        let config = db_config();
        let clock = MockClock::at_epoch();
        let connector = Arc::new(MemoryConnector::new(&config.tables).unwrap());
        let env = EnvironmentSwitch::new(&config, connector, store, Arc::new(clock.clone()))
            .unwrap();
        (env, clock)
    }

    fn rows(env: &EnvironmentSwitch, table: &str) -> Vec<Value> {
        env.client().select(table, &Filters::new()).unwrap()
    }

    #[test]
    fn test_failed_restore_leaves_tables_untouched() {
        let store = MemoryStore::new();
        let (env, _) = switch_with(Arc::new(store.clone()));
        env.client().insert("projects", &[json!({"id": 1})]).unwrap();

        let mut tables = BTreeMap::new();
        tables.insert("projects".to_string(), vec![json!({"id": 9}), json!(42)]);
        let broken = DatabaseSnapshot {
            id: "broken".to_string(),
            name: "broken".to_string(),
            description: None,
            created_at: Utc::now(),
            mode: DbMode::Test,
            tables,
            metadata: SnapshotMetadata {
                size_bytes: 0,
                table_count: 1,
                row_count: 2,
            },
        };
        store
            .save("broken", &serde_json::to_value(&broken).unwrap())
            .unwrap();

        assert!(env.restore_snapshot("broken").is_err());
        assert_eq!(rows(&env, "projects"), vec![json!({"id": 1})]);
    }

    #[test]
    fn test_snapshot_restore_exact_rows() {
        let (env, _) = switch_with(Arc::new(MemoryStore::new()));
        env.client().insert("projects", &[json!({"id": 1})]).unwrap();

        let id = env.create_snapshot("s1", None).unwrap();
        env.client().insert("projects", &[json!({"id": 2})]).unwrap();
        env.client().insert("artifacts", &[json!({"id": "x"})]).unwrap();

        env.restore_snapshot(&id).unwrap();
        assert_eq!(rows(&env, "projects"), vec![json!({"id": 1})]);
        assert!(rows(&env, "artifacts").is_empty());
    }

    #[test]
    fn test_snapshot_metadata() {
        let (env, _) = switch_with(Arc::new(MemoryStore::new()));
        env.client()
            .insert("projects", &[json!({"id": 1}), json!({"id": 2})])
            .unwrap();
        let id = env.create_snapshot("meta", Some("two rows")).unwrap();

        let snapshot = env.get_snapshot(&id).unwrap();
        assert_eq!(snapshot.metadata.table_count, 2);
        assert_eq!(snapshot.metadata.row_count, 2);
        assert_eq!(
            snapshot.metadata.size_bytes,
            serde_json::to_vec(&snapshot.tables).unwrap().len()
        );
        assert_eq!(snapshot.description.as_deref(), Some("two rows"));
    }

    #[test]
    fn test_restore_unknown_snapshot_fails() {
        let (env, _) = switch_with(Arc::new(MemoryStore::new()));
        let err = env.restore_snapshot("missing").unwrap_err();
        assert!(matches!(err, FlowProbeError::SnapshotNotFound(id) if id == "missing"));
    }

    #[test]
    fn test_snapshot_recovered_from_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store: SharedStore = Arc::new(FileStore::new(dir.path()));

        let (first, _) = switch_with(store.clone());
        first.client().insert("projects", &[json!({"id": 7})]).unwrap();
        let id = first.create_snapshot("persisted", None).unwrap();
        assert!(dir.path().join(format!("{}.json", id)).exists());

        let (second, _) = switch_with(store);
        assert_eq!(second.list_snapshots().len(), 1);
        second.restore_snapshot(&id).unwrap();
        assert_eq!(rows(&second, "projects"), vec![json!({"id": 7})]);
    }

    #[test]
    fn test_reset_prefers_latest_clean_state() {
        let (env, clock) = switch_with(Arc::new(MemoryStore::new()));
        env.client().insert("projects", &[json!({"v": "old"})]).unwrap();
        env.create_snapshot(CLEAN_STATE_SNAPSHOT, None).unwrap();

        clock.advance_ms(10);
        env.clear_all_tables().unwrap();
        env.client().insert("projects", &[json!({"v": "new"})]).unwrap();
        env.create_snapshot(CLEAN_STATE_SNAPSHOT, None).unwrap();

        env.client().insert("projects", &[json!({"v": "dirty"})]).unwrap();
        env.reset_to_clean_state().unwrap();
        assert_eq!(rows(&env, "projects"), vec![json!({"v": "new"})]);
    }

    #[test]
    fn test_reset_without_clean_state_clears() {
        let (env, _) = switch_with(Arc::new(MemoryStore::new()));
        env.client().insert("projects", &[json!({"id": 1})]).unwrap();
        env.reset_to_clean_state().unwrap();
        assert_eq!(env.count("projects", &Filters::new()).unwrap(), 0);
    }

    #[test]
    fn test_switch_mode_selects_separate_store() {
        let (env, _) = switch_with(Arc::new(MemoryStore::new()));
        assert_eq!(env.mode(), DbMode::Test);
        env.client().insert("projects", &[json!({"id": 1})]).unwrap();

        env.switch_mode(DbMode::Production).unwrap();
        env.switch_mode(DbMode::Production).unwrap();
        assert_eq!(env.mode(), DbMode::Production);
        assert!(rows(&env, "projects").is_empty());

        env.switch_mode(DbMode::Test).unwrap();
        assert_eq!(rows(&env, "projects").len(), 1);
    }

    #[test]
    fn test_sqlite_connector_requires_path() {
        let config = DatabaseConfig {
            production_path: PathBuf::new(),
            ..db_config()
        };
        let connector = SqliteConnector::new(&config);
        let err = connector.connect(DbMode::Production).err().unwrap();
        assert!(matches!(err, FlowProbeError::Config(_)));
    }

    #[test]
    fn test_delete_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let (env, _) = switch_with(store.clone());
        let id = env.create_snapshot("gone", None).unwrap();

        assert!(env.delete_snapshot(&id).unwrap());
        assert!(!env.delete_snapshot(&id).unwrap());
        assert!(store.keys().unwrap().is_empty());
        assert!(env.list_snapshots().is_empty());
    }
}
