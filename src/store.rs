//! Data Store Adapter - uniform access to one SQLite-backed store
//!
//! Each store exposes the same five logical collections. Records are JSON
//! documents keyed by a row id; filters are field equality conditions that
//! are pushed down to SQLite with `json_extract`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{DocforgeError, Result};

pub type StoreId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Templates,
    PlaceholderDefinitions,
    Datapoints,
    GeneratedDocuments,
    SyncLog,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Templates,
        Collection::PlaceholderDefinitions,
        Collection::Datapoints,
        Collection::GeneratedDocuments,
        Collection::SyncLog,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Collection::Templates => "templates",
            Collection::PlaceholderDefinitions => "placeholder_definitions",
            Collection::Datapoints => "datapoints",
            Collection::GeneratedDocuments => "generated_documents",
            Collection::SyncLog => "sync_log",
        }
    }

    /// Append-only collections never overwrite an existing row.
    pub fn is_append_only(self) -> bool {
        matches!(self, Collection::GeneratedDocuments | Collection::SyncLog)
    }
}

/// A stored document and its row id.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub doc: Map<String, Value>,
}

impl Record {
    pub fn new<T: Serialize>(id: impl Into<String>, value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(doc) => Ok(Self { id: id.into(), doc }),
            other => Err(DocforgeError::Storage {
                store: String::new(),
                reason: format!("record body must be an object, got {}", other),
            }),
        }
    }

    /// Record whose id is assigned by the store on write.
    pub fn generated<T: Serialize>(value: &T) -> Result<Self> {
        Self::new(String::new(), value)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.doc.clone()))?)
    }
}

/// Conjunction of field equality conditions.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((field.to_string(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }
}

/// Handle passed into [`DataStore::scoped_transaction`].
pub trait StoreTxn {
    fn read(&mut self, collection: Collection, filter: &Filter) -> Result<Vec<Record>>;
    fn write(&mut self, collection: Collection, record: Record) -> Result<String>;
}

/// Uniform read/write access to one structured store.
///
/// Implementations must map transport failures (locked database, timeouts,
/// unreachable files) to [`DocforgeError::StoreUnavailable`].
pub trait DataStore: Send + Sync {
    fn id(&self) -> &str;

    fn read(&self, collection: Collection, filter: &Filter) -> Result<Vec<Record>>;

    fn write(&self, collection: Collection, record: Record) -> Result<String>;

    /// Runs `body` in one transaction. Writes commit together when `body`
    /// returns `Ok`, and none of them survive otherwise.
    fn scoped_transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreTxn) -> Result<()>,
    ) -> Result<()>;
}

pub struct SqliteStore {
    id: StoreId,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(id: impl Into<StoreId>, path: &Path, busy_timeout: Duration) -> Result<Self> {
        let id = id.into();
        let conn = Connection::open(path).map_err(|e| classify(&id, e))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
            .map_err(|e| classify(&id, e))?;
        Self::init(id, conn, busy_timeout)
    }

    pub fn open_in_memory(id: impl Into<StoreId>) -> Result<Self> {
        let id = id.into();
        let conn = Connection::open_in_memory().map_err(|e| classify(&id, e))?;
        Self::init(id, conn, Duration::from_secs(5))
    }

    fn init(id: StoreId, conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout).map_err(|e| classify(&id, e))?;
        for collection in Collection::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    doc TEXT NOT NULL,
                    written_at TEXT NOT NULL
                );",
                collection.table()
            ))
            .map_err(|e| classify(&id, e))?;
        }
        debug!(store = %id, "store opened");
        Ok(Self {
            id,
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DocforgeError::StoreUnavailable {
            store: self.id.clone(),
            reason: "connection lock poisoned".to_string(),
        })
    }
}

impl DataStore for SqliteStore {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&self, collection: Collection, filter: &Filter) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        read_records(&conn, &self.id, collection, filter)
    }

    fn write(&self, collection: Collection, record: Record) -> Result<String> {
        let conn = self.lock()?;
        write_record(&conn, &self.id, collection, record)
    }

    fn scoped_transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreTxn) -> Result<()>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| classify(&self.id, e))?;
        let mut handle = SqliteTxn {
            store: &self.id,
            conn: &tx,
        };
        // Dropping `tx` on the error path rolls everything back.
        body(&mut handle)?;
        tx.commit().map_err(|e| classify(&self.id, e))
    }
}

struct SqliteTxn<'c> {
    store: &'c str,
    conn: &'c Connection,
}

impl StoreTxn for SqliteTxn<'_> {
    fn read(&mut self, collection: Collection, filter: &Filter) -> Result<Vec<Record>> {
        read_records(self.conn, self.store, collection, filter)
    }

    fn write(&mut self, collection: Collection, record: Record) -> Result<String> {
        write_record(self.conn, self.store, collection, record)
    }
}

fn read_records(
    conn: &Connection,
    store: &str,
    collection: Collection,
    filter: &Filter,
) -> Result<Vec<Record>> {
    let mut sql = format!("SELECT id, doc FROM {}", collection.table());
    let mut args: Vec<SqlValue> = Vec::new();

    for (i, (field, value)) in filter.conditions().iter().enumerate() {
        if !is_valid_field(field) {
            return Err(DocforgeError::Storage {
                store: store.to_string(),
                reason: format!("invalid filter field: {:?}", field),
            });
        }
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        args.push(SqlValue::Text(format!("$.{}", field)));
        let path_idx = args.len();
        match json_to_sql(value) {
            Some(v) => {
                args.push(v);
                sql.push_str(&format!("json_extract(doc, ?{}) = ?{}", path_idx, args.len()));
            }
            None => sql.push_str(&format!("json_extract(doc, ?{}) IS NULL", path_idx)),
        }
    }
    sql.push_str(" ORDER BY rowid");

    let mut stmt = conn.prepare(&sql).map_err(|e| classify(store, e))?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| classify(store, e))?;

    let mut records = Vec::new();
    for row in rows {
        let (id, doc) = row.map_err(|e| classify(store, e))?;
        match serde_json::from_str::<Value>(&doc)? {
            Value::Object(doc) => records.push(Record { id, doc }),
            _ => {
                return Err(DocforgeError::Storage {
                    store: store.to_string(),
                    reason: format!("row {} in {} is not a JSON object", id, collection.table()),
                })
            }
        }
    }
    Ok(records)
}

fn write_record(
    conn: &Connection,
    store: &str,
    collection: Collection,
    record: Record,
) -> Result<String> {
    let id = if record.id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        record.id
    };
    let doc = serde_json::to_string(&Value::Object(record.doc))?;
    let now = Utc::now().to_rfc3339();

    let sql = if collection.is_append_only() {
        format!(
            "INSERT INTO {} (id, doc, written_at) VALUES (?1, ?2, ?3)",
            collection.table()
        )
    } else {
        format!(
            "INSERT INTO {} (id, doc, written_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET doc = excluded.doc, written_at = excluded.written_at",
            collection.table()
        )
    };

    conn.execute(&sql, params![id, doc, now]).map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::ConstraintViolation => {
            DocforgeError::Storage {
                store: store.to_string(),
                reason: format!("{} already holds record {}", collection.table(), id),
            }
        }
        _ => classify(store, e),
    })?;
    Ok(id)
}

fn is_valid_field(field: &str) -> bool {
    !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn json_to_sql(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(SqlValue::Integer(i)),
            None => Some(SqlValue::Real(n.as_f64().unwrap_or_default())),
        },
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}

/// Transport-level failures are retryable; everything else is a storage defect.
fn classify(store: &str, err: rusqlite::Error) -> DocforgeError {
    let transient = match &err {
        rusqlite::Error::SqliteFailure(code, _) => matches!(
            code.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::OperationInterrupted
        ),
        _ => false,
    };
    if transient {
        DocforgeError::StoreUnavailable {
            store: store.to_string(),
            reason: err.to_string(),
        }
    } else {
        DocforgeError::Storage {
            store: store.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Priority-ordered set of stores. Earlier stores win datapoint ties.
#[derive(Clone, Default)]
pub struct StoreSet {
    stores: Vec<Arc<dyn DataStore>>,
}

impl StoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(configs: &[StoreConfig], busy_timeout: Duration) -> Result<Self> {
        let mut set = Self::new();
        for cfg in configs {
            let store = SqliteStore::open(cfg.id.clone(), &cfg.path, busy_timeout)?;
            set.register(Arc::new(store));
        }
        Ok(set)
    }

    /// Adds a store, replacing any store registered under the same id.
    pub fn register(&mut self, store: Arc<dyn DataStore>) {
        if let Some(slot) = self.stores.iter_mut().find(|s| s.id() == store.id()) {
            *slot = store;
        } else {
            self.stores.push(store);
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn DataStore>> {
        self.stores
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or_else(|| DocforgeError::UnknownStore(id.to_string()))
    }

    /// Stores in the order the ids are given.
    pub fn select(&self, ids: &[String]) -> Result<Vec<Arc<dyn DataStore>>> {
        ids.iter().map(|id| self.get(id)).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, doc: Value) -> Record {
        match doc {
            Value::Object(doc) => Record {
                id: id.to_string(),
                doc,
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_write_then_filtered_read() {
        let store = SqliteStore::open_in_memory("a").unwrap();
        store
            .write(Collection::Datapoints, record("1", json!({"key": "build_count", "value": 3})))
            .unwrap();
        store
            .write(Collection::Datapoints, record("2", json!({"key": "owner", "value": "ops"})))
            .unwrap();

        let found = store
            .read(Collection::Datapoints, &Filter::all().eq("key", "owner"))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "2");
        assert_eq!(found[0].doc["value"], json!("ops"));

        let all = store.read(Collection::Datapoints, &Filter::all()).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_filter_on_numbers_and_bools() {
        let store = SqliteStore::open_in_memory("a").unwrap();
        store
            .write(Collection::Templates, record("t@v1", json!({"version": 1, "active": true})))
            .unwrap();
        store
            .write(Collection::Templates, record("t@v2", json!({"version": 2, "active": false})))
            .unwrap();

        let active = store
            .read(Collection::Templates, &Filter::all().eq("active", true))
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "t@v1");

        let v2 = store
            .read(Collection::Templates, &Filter::all().eq("version", 2))
            .unwrap();
        assert_eq!(v2[0].id, "t@v2");
    }

    #[test]
    fn test_generated_id_assigned() {
        let store = SqliteStore::open_in_memory("a").unwrap();
        let id = store
            .write(Collection::Datapoints, Record::generated(&json!({"key": "k"})).unwrap())
            .unwrap();
        assert!(!id.is_empty());
        let rows = store.read(Collection::Datapoints, &Filter::all()).unwrap();
        assert_eq!(rows[0].id, id);
    }

    #[test]
    fn test_append_only_rejects_overwrite() {
        let store = SqliteStore::open_in_memory("a").unwrap();
        store
            .write(Collection::SyncLog, record("s1", json!({"n": 1})))
            .unwrap();
        let err = store
            .write(Collection::SyncLog, record("s1", json!({"n": 2})))
            .unwrap_err();
        assert!(matches!(err, DocforgeError::Storage { .. }));

        let rows = store.read(Collection::SyncLog, &Filter::all()).unwrap();
        assert_eq!(rows[0].doc["n"], json!(1));
    }

    #[test]
    fn test_mutable_collection_upserts() {
        let store = SqliteStore::open_in_memory("a").unwrap();
        store
            .write(Collection::Templates, record("t@v1", json!({"active": true})))
            .unwrap();
        store
            .write(Collection::Templates, record("t@v1", json!({"active": false})))
            .unwrap();
        let rows = store.read(Collection::Templates, &Filter::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc["active"], json!(false));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = SqliteStore::open_in_memory("a").unwrap();
        let result = store.scoped_transaction(&mut |tx| {
            tx.write(Collection::Templates, record("t@v1", json!({"version": 1})))?;
            Err(DocforgeError::TemplateNotFound("boom".into()))
        });
        assert!(result.is_err());
        assert!(store.read(Collection::Templates, &Filter::all()).unwrap().is_empty());
    }

    #[test]
    fn test_transaction_reads_own_writes() {
        let store = SqliteStore::open_in_memory("a").unwrap();
        let mut seen = 0;
        store
            .scoped_transaction(&mut |tx| {
                tx.write(Collection::Templates, record("t@v1", json!({"version": 1})))?;
                seen = tx.read(Collection::Templates, &Filter::all())?.len();
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_invalid_filter_field_rejected() {
        let store = SqliteStore::open_in_memory("a").unwrap();
        let err = store
            .read(Collection::Templates, &Filter::all().eq("x') OR 1=1 --", 1))
            .unwrap_err();
        assert!(matches!(err, DocforgeError::Storage { .. }));
    }

    #[test]
    fn test_file_store_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.db");
        {
            let store = SqliteStore::open("a", &path, Duration::from_secs(1)).unwrap();
            store
                .write(Collection::Datapoints, record("1", json!({"key": "k"})))
                .unwrap();
        }
        let store = SqliteStore::open("a", &path, Duration::from_secs(1)).unwrap();
        assert_eq!(store.read(Collection::Datapoints, &Filter::all()).unwrap().len(), 1);
    }

    #[test]
    fn test_store_set_select_preserves_order() {
        let mut set = StoreSet::new();
        set.register(Arc::new(SqliteStore::open_in_memory("a").unwrap()));
        set.register(Arc::new(SqliteStore::open_in_memory("b").unwrap()));
        let picked = set.select(&["b".to_string(), "a".to_string()]).unwrap();
        assert_eq!(picked[0].id(), "b");
        assert_eq!(picked[1].id(), "a");
        assert!(matches!(set.get("zzz"), Err(DocforgeError::UnknownStore(_))));
    }
}
