mod outbox;

pub use outbox::{OutboxEntry, PendingOp};

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::models::{Record, now_iso};
use crate::platform::{NativePlatform, Platform};

pub const AGENTS: &str = "agents";
pub const EXECUTIONS: &str = "executions";
pub const USERS: &str = "users";
pub const ANALYSIS_RESULTS: &str = "analysis_results";
pub const INVOICE_FILES: &str = "invoice_files";
pub const CLIENTS: &str = "clients";
pub const PRODUCTS: &str = "products";
pub const OUTBOX: &str = "outbox";
pub const SESSION_KEY: &str = "opti_agent_user";

pub fn mission_order_key(agent_id: &str) -> String {
    format!("missionOrder_{}", agent_id)
}

pub fn mission_order_file_key(agent_id: &str) -> String {
    format!("missionOrderFile_{}", agent_id)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Local storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: u64, quota: u64 },

    #[error("Stored value under '{key}' is not valid JSON: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key/value cache of JSON collections, backed by a single SQLite table.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Connection>>,
    quota_bytes: u64,
}

fn id_of(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn field_matches(value: &Value, field: &str, expected: &str) -> bool {
    match value.get(field) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Number(n)) => n.to_string() == expected,
        _ => false,
    }
}

fn read_raw(db: &Connection, key: &str) -> StoreResult<Option<String>> {
    Ok(db
        .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?)
}

fn write_raw(db: &Connection, quota: u64, key: &str, value: &str) -> StoreResult<()> {
    let others: i64 = db.query_row(
        "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM kv WHERE key != ?1",
        params![key],
        |row| row.get(0),
    )?;
    let needed = others.max(0) as u64 + value.len() as u64;
    if needed > quota {
        return Err(StoreError::QuotaExceeded { needed, quota });
    }
    db.execute(
        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now_iso()],
    )?;
    Ok(())
}

/// Read a collection as raw JSON items. A corrupt value reads as empty.
fn read_items(db: &Connection, collection: &str) -> StoreResult<Vec<Value>> {
    let Some(raw) = read_raw(db, collection)? else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(_) => {
            warn!("Collection '{}' is not a list, treating as empty", collection);
            Ok(Vec::new())
        }
        Err(source) => {
            let err = StoreError::Corrupt {
                key: collection.to_string(),
                source,
            };
            warn!("{}", err);
            Ok(Vec::new())
        }
    }
}

fn write_items(db: &Connection, quota: u64, collection: &str, items: &[Value]) -> StoreResult<()> {
    let raw = serde_json::to_string(items)?;
    write_raw(db, quota, collection, &raw)
}

fn decode_items<T: DeserializeOwned>(collection: &str, items: Vec<Value>) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<T>(item) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Skipping unreadable entry in '{}': {}", collection, e);
                None
            }
        })
        .collect()
}

fn upsert(items: &mut Vec<Value>, id: &str, value: Value) {
    match items.iter().position(|v| id_of(v).as_deref() == Some(id)) {
        Some(idx) => items[idx] = value,
        None => items.push(value),
    }
}

impl LocalStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P, quota_bytes: u64) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(data_dir).await?;
        }
        NativePlatform::restrict_dir_permissions(data_dir);

        let db_path = data_dir.join("store.db");
        let db = Connection::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);
        debug!("Opened local store at {}", db_path.display());
        Self::init(db, quota_bytes)
    }

    pub fn in_memory(quota_bytes: u64) -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, quota_bytes)
    }

    fn init(db: Connection, quota_bytes: u64) -> StoreResult<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            quota_bytes,
        })
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    /// Bytes currently used by stored values.
    pub async fn usage(&self) -> StoreResult<u64> {
        let db = self.db.lock().await;
        let used: i64 = db.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM kv",
            [],
            |row| row.get(0),
        )?;
        Ok(used.max(0) as u64)
    }

    pub async fn get_raw(&self, key: &str) -> StoreResult<Option<String>> {
        let db = self.db.lock().await;
        read_raw(&db, key)
    }

    pub async fn set_raw(&self, key: &str, value: &str) -> StoreResult<()> {
        let db = self.db.lock().await;
        write_raw(&db, self.quota_bytes, key, value)
    }

    pub async fn remove_raw(&self, key: &str) -> StoreResult<bool> {
        let db = self.db.lock().await;
        let removed = db.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    /// Single JSON value under `key`. Unreadable values read as absent.
    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(source) => {
                warn!(
                    "{}",
                    StoreError::Corrupt {
                        key: key.to_string(),
                        source
                    }
                );
                Ok(None)
            }
        }
    }

    pub async fn set_value<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key, &raw).await
    }

    pub async fn get<T: DeserializeOwned>(&self, collection: &str) -> StoreResult<Vec<T>> {
        let items = {
            let db = self.db.lock().await;
            read_items(&db, collection)?
        };
        Ok(decode_items(collection, items))
    }

    pub async fn find<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> StoreResult<Option<T>> {
        let items = {
            let db = self.db.lock().await;
            read_items(&db, collection)?
        };
        Ok(items
            .into_iter()
            .find(|v| id_of(v).as_deref() == Some(id))
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    /// Items whose `field` equals `owner` (e.g. `agentId`, `userId`, `executionId`).
    pub async fn filter_by_owner<T: DeserializeOwned>(
        &self,
        collection: &str,
        field: &str,
        owner: &str,
    ) -> StoreResult<Vec<T>> {
        let items = {
            let db = self.db.lock().await;
            read_items(&db, collection)?
        };
        let matching = items
            .into_iter()
            .filter(|v| field_matches(v, field, owner))
            .collect();
        Ok(decode_items(collection, matching))
    }

    /// Upsert by id: replace in place when present, append otherwise.
    pub async fn save<T: Record + Serialize>(&self, collection: &str, item: &T) -> StoreResult<()> {
        self.save_all(collection, std::slice::from_ref(item)).await
    }

    pub async fn save_all<T: Record + Serialize>(
        &self,
        collection: &str,
        new_items: &[T],
    ) -> StoreResult<()> {
        let db = self.db.lock().await;
        let mut items = read_items(&db, collection)?;
        for item in new_items {
            upsert(&mut items, &item.record_id(), serde_json::to_value(item)?);
        }
        write_items(&db, self.quota_bytes, collection, &items)
    }

    pub async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let db = self.db.lock().await;
        let mut items = read_items(&db, collection)?;
        let before = items.len();
        items.retain(|v| id_of(v).as_deref() != Some(id));
        if items.len() == before {
            return Ok(false);
        }
        write_items(&db, self.quota_bytes, collection, &items)?;
        Ok(true)
    }

    /// Remove every item whose `field` equals `owner`. Returns how many went.
    pub async fn delete_by_owner(
        &self,
        collection: &str,
        field: &str,
        owner: &str,
    ) -> StoreResult<usize> {
        let db = self.db.lock().await;
        let mut items = read_items(&db, collection)?;
        let before = items.len();
        items.retain(|v| !field_matches(v, field, owner));
        let removed = before - items.len();
        if removed > 0 {
            write_items(&db, self.quota_bytes, collection, &items)?;
        }
        Ok(removed)
    }

    /// Replace the items owned by `owner` with `fresh`, keeping everyone else's.
    pub async fn replace_owned<T: Record + Serialize>(
        &self,
        collection: &str,
        field: &str,
        owner: &str,
        fresh: &[T],
    ) -> StoreResult<()> {
        let db = self.db.lock().await;
        let mut items = read_items(&db, collection)?;
        items.retain(|v| !field_matches(v, field, owner));
        for item in fresh {
            upsert(&mut items, &item.record_id(), serde_json::to_value(item)?);
        }
        write_items(&db, self.quota_bytes, collection, &items)
    }

    pub async fn replace_all<T: Serialize>(&self, collection: &str, items: &[T]) -> StoreResult<()> {
        let raw = serde_json::to_string(items)?;
        self.set_raw(collection, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Agent, Client};

    fn agent(id: &str, name: &str, user: &str) -> Agent {
        Agent {
            id: id.to_string(),
            name: name.to_string(),
            role: "Reviewer".to_string(),
            description: None,
            created_at: Some(now_iso()),
            user_id: Some(user.to_string()),
            invoices: vec![],
        }
    }

    #[tokio::test]
    async fn missing_collection_reads_empty() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        let agents: Vec<Agent> = store.get(AGENTS).await.unwrap();
        assert!(agents.is_empty());
        assert!(store.find::<Agent>(AGENTS, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_upserts_by_id() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        store.save(AGENTS, &agent("1", "first", "u1")).await.unwrap();
        store.save(AGENTS, &agent("2", "second", "u1")).await.unwrap();
        store.save(AGENTS, &agent("1", "renamed", "u1")).await.unwrap();

        let agents: Vec<Agent> = store.get(AGENTS).await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].name, "renamed");
        assert_eq!(agents[1].name, "second");
    }

    #[tokio::test]
    async fn numeric_ids_are_matched() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        let client = Client {
            id: 7,
            name: "Acme".into(),
            contact: String::new(),
            email: String::new(),
            phone: String::new(),
        };
        store.save(CLIENTS, &client).await.unwrap();
        let found: Option<Client> = store.find(CLIENTS, "7").await.unwrap();
        assert_eq!(found.map(|c| c.name), Some("Acme".to_string()));
        assert!(store.delete(CLIENTS, "7").await.unwrap());
    }

    #[tokio::test]
    async fn owner_filters_and_deletes() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        store.save(AGENTS, &agent("1", "a", "u1")).await.unwrap();
        store.save(AGENTS, &agent("2", "b", "u2")).await.unwrap();
        store.save(AGENTS, &agent("3", "c", "u1")).await.unwrap();

        let mine: Vec<Agent> = store.filter_by_owner(AGENTS, "userId", "u1").await.unwrap();
        assert_eq!(mine.len(), 2);

        let removed = store.delete_by_owner(AGENTS, "userId", "u1").await.unwrap();
        assert_eq!(removed, 2);
        let rest: Vec<Agent> = store.get(AGENTS).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "2");
    }

    #[tokio::test]
    async fn replace_owned_keeps_other_owners() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        store.save(AGENTS, &agent("1", "stale", "u1")).await.unwrap();
        store.save(AGENTS, &agent("2", "other", "u2")).await.unwrap();
        store
            .replace_owned(AGENTS, "userId", "u1", &[agent("9", "fresh", "u1")])
            .await
            .unwrap();

        let all: Vec<Agent> = store.get(AGENTS).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "9"]);
    }

    #[tokio::test]
    async fn corrupt_values_read_as_empty() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        store.set_raw(AGENTS, "{not json").await.unwrap();
        let agents: Vec<Agent> = store.get(AGENTS).await.unwrap();
        assert!(agents.is_empty());

        store.set_raw(SESSION_KEY, "[[[").await.unwrap();
        let session: Option<Agent> = store.get_value(SESSION_KEY).await.unwrap();
        assert!(session.is_none());

        // saving over a corrupt collection starts a fresh list
        store.save(AGENTS, &agent("1", "a", "u1")).await.unwrap();
        assert_eq!(store.get::<Agent>(AGENTS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn quota_overflow_is_typed_and_leaves_data_intact() {
        let store = LocalStore::in_memory(64).unwrap();
        store.set_raw("small", "0123456789").await.unwrap();

        let big = "x".repeat(60);
        let err = store.set_raw("big", &big).await.unwrap_err();
        assert!(err.is_quota());
        match err {
            StoreError::QuotaExceeded { needed, quota } => {
                assert_eq!(needed, 70);
                assert_eq!(quota, 64);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.get_raw("small").await.unwrap().as_deref(), Some("0123456789"));
        assert!(store.get_raw("big").await.unwrap().is_none());

        // overwriting a key only counts its new size
        store.set_raw("small", &"y".repeat(60)).await.unwrap();
        assert_eq!(store.usage().await.unwrap(), 60);
    }

    #[tokio::test]
    async fn raw_keys_round_trip_and_remove() {
        let store = LocalStore::in_memory(1024).unwrap();
        let key = mission_order_key("a1");
        assert_eq!(key, "missionOrder_a1");
        store.set_raw(&key, "{\"id\":\"m\"}").await.unwrap();
        assert!(store.remove_raw(&key).await.unwrap());
        assert!(!store.remove_raw(&key).await.unwrap());
    }

    #[tokio::test]
    async fn open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("data"), 1024).await.unwrap();
        store.set_raw("k", "v").await.unwrap();
        assert!(dir.path().join("data").join("store.db").exists());

        let reopened = LocalStore::open(dir.path().join("data"), 1024).await.unwrap();
        assert_eq!(reopened.get_raw("k").await.unwrap().as_deref(), Some("v"));
    }
}
