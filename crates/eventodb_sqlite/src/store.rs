//! SQLite backend. The registry lives in its own database file; every
//! namespace gets a dedicated database file next to it, created when the
//! namespace is and deleted with it.
//!
//! SQLite has no advisory locks, so writes serialize through an in-process
//! mutex map keyed by `(namespace, category)`. The global position is the
//! messages table's `AUTOINCREMENT` rowid: persistent, monotonic, assigned
//! in the same transaction as the insert, never reused.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use eventodb::error::{Error, Result};
use eventodb::namespace::{validate_namespace_id, Namespace, NamespaceStats};
use eventodb::store::{
    effective_batch_size, GetCategoryMessagesOpts, GetStreamMessagesOpts, Store, StoreHealth,
    WriteMessageOpts, WrittenMessage,
};
use eventodb::stream_name::{Category, StreamName};
use eventodb::Message;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

/// Attempts to open a namespace database that the registry says exists but
/// is not visible yet (created by a concurrent `ns.create`).
const VISIBILITY_RETRIES: u32 = 3;
const VISIBILITY_BACKOFF: Duration = Duration::from_millis(25);

const MESSAGE_COLUMNS: &str =
    r#"id, stream_name, "type", position, global_position, data, metadata, time"#;

const NAMESPACE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    global_position INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    stream_name TEXT NOT NULL,
    category TEXT NOT NULL,
    cardinal_id TEXT NOT NULL,
    "type" TEXT NOT NULL,
    position INTEGER NOT NULL,
    data TEXT NOT NULL,
    metadata TEXT,
    time TEXT NOT NULL,
    UNIQUE (stream_name, position)
);
CREATE INDEX IF NOT EXISTS messages_stream_idx ON messages (stream_name, position);
CREATE INDEX IF NOT EXISTS messages_category_idx ON messages (category, global_position);
"#;

const REGISTRY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS namespaces (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    data_dir: PathBuf,
    registry: SqlitePool,
    pools: Arc<RwLock<HashMap<String, SqlitePool>>>,
    category_locks: Arc<DashMap<(String, String), Arc<Mutex<()>>>>,
}

impl SqliteStore {
    /// Opens (or creates) the store under `data_dir`, with the namespace
    /// registry in `registry_file`.
    pub async fn open(data_dir: impl Into<PathBuf>, registry_file: &str) -> Result<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(Error::backend)?;

        let registry = open_database(&data_dir.join(registry_file), true).await?;
        sqlx::query(REGISTRY_SCHEMA)
            .execute(&registry)
            .await
            .map_err(Error::backend)?;

        Ok(SqliteStore {
            data_dir,
            registry,
            pools: Arc::new(RwLock::new(HashMap::new())),
            category_locks: Arc::new(DashMap::new()),
        })
    }

    fn namespace_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{id}.db"))
    }

    async fn registry_record(&self, id: &str) -> Result<Namespace> {
        let row = sqlx::query(
            "SELECT id, token_hash, description, created_at FROM namespaces WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.registry)
        .await
        .map_err(Error::backend)?
        .ok_or_else(|| Error::NamespaceNotFound(id.to_string()))?;

        row_to_namespace(&row)
    }

    /// Per-namespace connection pools, lazily opened and cached behind a
    /// read-write lock with a double-checked insert on the write path.
    async fn namespace_pool(&self, id: &str) -> Result<SqlitePool> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(id) {
                return Ok(pool.clone());
            }
        }

        self.registry_record(id).await?;

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(id) {
            return Ok(pool.clone());
        }

        // The registry row is there, so the file is on its way even if a
        // concurrent create has not finished writing it.
        let path = self.namespace_path(id);
        let mut attempt = 0;
        let pool = loop {
            match open_database(&path, false).await {
                Ok(pool) => break pool,
                Err(_) if attempt < VISIBILITY_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(VISIBILITY_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        };
        sqlx::query(NAMESPACE_SCHEMA)
            .execute(&pool)
            .await
            .map_err(Error::backend)?;

        pools.insert(id.to_string(), pool.clone());
        Ok(pool)
    }

    fn category_lock(&self, namespace: &str, category: &Category<'_>) -> Arc<Mutex<()>> {
        let key = (namespace.to_string(), category.to_string());
        self.category_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

async fn open_database(path: &Path, create: bool) -> Result<SqlitePool> {
    if !create && !path.exists() {
        return Err(Error::backend(anyhow::anyhow!(
            "database file {} does not exist",
            path.display()
        )));
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(Error::backend)
}

fn row_to_namespace(row: &SqliteRow) -> Result<Namespace> {
    let created_at: String = row.try_get("created_at").map_err(Error::backend)?;
    Ok(Namespace {
        id: row.try_get("id").map_err(Error::backend)?,
        token_hash: row.try_get("token_hash").map_err(Error::backend)?,
        description: row.try_get("description").map_err(Error::backend)?,
        created_at: parse_time(&created_at)?,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<Message<'static>> {
    let id: String = row.try_get("id").map_err(Error::backend)?;
    let stream_name: String = row.try_get("stream_name").map_err(Error::backend)?;
    let msg_type: String = row.try_get("type").map_err(Error::backend)?;
    let data: String = row.try_get("data").map_err(Error::backend)?;
    let metadata: Option<String> = row.try_get("metadata").map_err(Error::backend)?;
    let time: String = row.try_get("time").map_err(Error::backend)?;

    Ok(Message {
        id: Uuid::parse_str(&id).map_err(Error::backend)?,
        stream_name: StreamName::new(stream_name)?.into_owned(),
        msg_type: std::borrow::Cow::Owned(msg_type),
        position: row.try_get("position").map_err(Error::backend)?,
        global_position: row.try_get("global_position").map_err(Error::backend)?,
        data: std::borrow::Cow::Owned(serde_json::from_str(&data).map_err(Error::backend)?),
        metadata: metadata
            .map(|m| serde_json::from_str(&m).map_err(Error::backend))
            .transpose()?
            .map(std::borrow::Cow::Owned),
        time: parse_time(&time)?,
    })
}

fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(Error::backend)
}

#[async_trait]
impl Store for SqliteStore {
    async fn write_message(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        msg_type: &str,
        data: &Value,
        opts: &WriteMessageOpts<'_>,
    ) -> Result<WrittenMessage> {
        let pool = self.namespace_pool(namespace).await?;
        let lock = self.category_lock(namespace, &stream_name.category());
        let _guard = lock.lock().await;

        let mut tx = pool.begin().await.map_err(Error::backend)?;

        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(position) FROM messages WHERE stream_name = ?1")
                .bind(stream_name.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(Error::backend)?;
        let version = version.unwrap_or(-1);

        if let Some(expected) = opts.expected_version {
            if expected != version {
                return Err(Error::WrongExpectedVersion {
                    stream_name: stream_name.to_string(),
                    expected,
                    actual: version,
                });
            }
        }

        let position = version + 1;
        let id = opts.id.unwrap_or_else(Uuid::new_v4);
        let metadata = opts
            .metadata
            .map(serde_json::to_string)
            .transpose()
            .map_err(Error::backend)?;
        let time = Utc::now();

        let global_position: i64 = sqlx::query_scalar(
            r#"INSERT INTO messages
                   (id, stream_name, category, cardinal_id, "type", position, data, metadata, time)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               RETURNING global_position"#,
        )
        .bind(id.to_string())
        .bind(stream_name.as_str())
        .bind(stream_name.category().as_str())
        .bind(stream_name.cardinal_id())
        .bind(msg_type)
        .bind(position)
        .bind(serde_json::to_string(data).map_err(Error::backend)?)
        .bind(metadata)
        .bind(encode_time(time))
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::backend)?;

        tx.commit().await.map_err(Error::backend)?;

        info!(
            namespace,
            stream_name = %stream_name,
            msg_type,
            position,
            global_position,
            "message written"
        );

        Ok(WrittenMessage {
            position,
            global_position,
            time,
        })
    }

    async fn get_stream_messages(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        opts: &GetStreamMessagesOpts,
    ) -> Result<Vec<Message<'static>>> {
        let pool = self.namespace_pool(namespace).await?;

        let position = opts.position.unwrap_or(0).max(0);
        let global_position = opts.global_position.unwrap_or(0);
        let batch = effective_batch_size(opts.batch_size);

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE stream_name = ?1 AND position >= ?2 AND global_position >= ?3 \
             ORDER BY position ASC"
        );
        if let Some(limit) = batch {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = sqlx::query(&sql)
            .bind(stream_name.as_str())
            .bind(position)
            .bind(global_position)
            .fetch_all(&pool)
            .await
            .map_err(Error::backend)?;

        rows.iter().map(row_to_message).collect()
    }

    async fn get_category_messages(
        &self,
        namespace: &str,
        category: &Category<'_>,
        opts: &GetCategoryMessagesOpts<'_>,
    ) -> Result<Vec<Message<'static>>> {
        let pool = self.namespace_pool(namespace).await?;

        let position = opts.position.unwrap_or(1).max(1);
        let batch = effective_batch_size(opts.batch_size);
        if batch == Some(0) {
            return Ok(Vec::new());
        }

        // Correlation and consumer-group filters run here rather than in
        // SQL; the batch limit applies to filtered results, so rows stream
        // in until the batch fills.
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE category = ?1 AND global_position >= ?2 \
             ORDER BY global_position ASC"
        );
        let mut rows = sqlx::query(&sql)
            .bind(category.as_str())
            .bind(position)
            .fetch(&pool);

        let mut messages = Vec::new();
        while let Some(row) = rows.try_next().await.map_err(Error::backend)? {
            let message = row_to_message(&row)?;
            if !opts.correlation_matches(&message)
                || !opts.consumer_group_matches(&message.stream_name)
            {
                continue;
            }
            messages.push(message);
            if batch.is_some_and(|n| messages.len() >= n) {
                break;
            }
        }

        Ok(messages)
    }

    async fn get_last_stream_message(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        msg_type: Option<&str>,
    ) -> Result<Option<Message<'static>>> {
        let pool = self.namespace_pool(namespace).await?;

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE stream_name = ?1"
        );
        if msg_type.is_some() {
            sql.push_str(r#" AND "type" = ?2"#);
        }
        sql.push_str(" ORDER BY position DESC LIMIT 1");

        let mut query = sqlx::query(&sql).bind(stream_name.as_str());
        if let Some(msg_type) = msg_type {
            query = query.bind(msg_type);
        }

        let row = query
            .fetch_optional(&pool)
            .await
            .map_err(Error::backend)?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn stream_version(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
    ) -> Result<Option<i64>> {
        let pool = self.namespace_pool(namespace).await?;

        sqlx::query_scalar("SELECT MAX(position) FROM messages WHERE stream_name = ?1")
            .bind(stream_name.as_str())
            .fetch_one(&pool)
            .await
            .map_err(Error::backend)
    }

    async fn create_namespace(
        &self,
        id: &str,
        token_hash: &str,
        description: Option<&str>,
    ) -> Result<Namespace> {
        validate_namespace_id(id)?;

        // Container first, registry row last; the registry is authoritative,
        // so an interrupted create leaves only an invisible orphan file.
        let pool = open_database(&self.namespace_path(id), true).await?;
        sqlx::query(NAMESPACE_SCHEMA)
            .execute(&pool)
            .await
            .map_err(Error::backend)?;

        let created_at = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO namespaces (id, token_hash, description, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(token_hash)
        .bind(description)
        .bind(encode_time(created_at))
        .execute(&self.registry)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(err))
                if matches!(err.kind(), ErrorKind::UniqueViolation) =>
            {
                pool.close().await;
                return Err(Error::NamespaceExists(id.to_string()));
            }
            Err(err) => {
                pool.close().await;
                return Err(Error::backend(err));
            }
        }

        self.pools.write().await.insert(id.to_string(), pool);

        info!(namespace = id, "namespace created");

        Ok(Namespace {
            id: id.to_string(),
            token_hash: token_hash.to_string(),
            description: description.map(str::to_string),
            created_at,
        })
    }

    async fn delete_namespace(&self, id: &str) -> Result<i64> {
        let pool = self.namespace_pool(id).await?;
        let deleted: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .map_err(Error::backend)?;

        let result = sqlx::query("DELETE FROM namespaces WHERE id = ?1")
            .bind(id)
            .execute(&self.registry)
            .await
            .map_err(Error::backend)?;
        if result.rows_affected() == 0 {
            return Err(Error::NamespaceNotFound(id.to_string()));
        }

        self.pools.write().await.remove(id);
        self.category_locks.retain(|(ns, _), _| ns != id);
        pool.close().await;

        let path = self.namespace_path(id);
        tokio::fs::remove_file(&path).await.map_err(Error::backend)?;
        for suffix in ["-wal", "-shm"] {
            let mut side = path.clone().into_os_string();
            side.push(suffix);
            let _ = tokio::fs::remove_file(&side).await;
        }

        info!(namespace = id, messages_deleted = deleted, "namespace deleted");

        Ok(deleted)
    }

    async fn get_namespace(&self, id: &str) -> Result<Namespace> {
        self.registry_record(id).await
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let rows = sqlx::query(
            "SELECT id, token_hash, description, created_at FROM namespaces ORDER BY id",
        )
        .fetch_all(&self.registry)
        .await
        .map_err(Error::backend)?;

        rows.iter().map(row_to_namespace).collect()
    }

    async fn namespace_stats(&self, id: &str) -> Result<NamespaceStats> {
        let pool = self.namespace_pool(id).await?;
        let row = sqlx::query("SELECT COUNT(*) AS count, MAX(global_position) AS last FROM messages")
            .fetch_one(&pool)
            .await
            .map_err(Error::backend)?;

        Ok(NamespaceStats {
            message_count: row.try_get("count").map_err(Error::backend)?,
            last_global_position: row.try_get("last").map_err(Error::backend)?,
        })
    }

    async fn health(&self) -> Result<StoreHealth> {
        let pools = self.pools.read().await;
        let connections = self.registry.size() + pools.values().map(|p| p.size()).sum::<u32>();
        Ok(StoreHealth {
            backend: "sqlite",
            connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const TOKEN_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    async fn open_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path(), "registry.db").await.unwrap();
        store
            .create_namespace("default", TOKEN_HASH, None)
            .await
            .unwrap();
        (store, dir)
    }

    async fn write(store: &SqliteStore, stream: &str, msg_type: &str) -> WrittenMessage {
        store
            .write_message(
                "default",
                &StreamName::new(stream).unwrap(),
                msg_type,
                &json!({}),
                &WriteMessageOpts::default(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn write_and_read_back() {
        let (store, _dir) = open_store().await;

        let first = write(&store, "account-1", "Opened").await;
        let second = write(&store, "account-1", "Deposited").await;
        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1);
        assert!(second.global_position > first.global_position);

        let stream = StreamName::new("account-1").unwrap();
        let messages = store
            .get_stream_messages("default", &stream, &GetStreamMessagesOpts::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].msg_type, "Opened");
        assert_eq!(messages[1].msg_type, "Deposited");
    }

    #[tokio::test]
    async fn version_conflict_rolls_back() {
        let (store, _dir) = open_store().await;
        write(&store, "account-2", "A").await;

        let err = store
            .write_message(
                "default",
                &StreamName::new("account-2").unwrap(),
                "A",
                &json!({}),
                &WriteMessageOpts {
                    expected_version: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::WrongExpectedVersion { expected: 5, actual: 0, .. }
        ));

        assert_eq!(
            store
                .stream_version("default", &StreamName::new("account-2").unwrap())
                .await
                .unwrap(),
            Some(0)
        );
    }

    #[tokio::test]
    async fn category_read_with_consumer_group() {
        let (store, _dir) = open_store().await;
        for n in 1..=10 {
            write(&store, &format!("order-{n}"), "Placed").await;
        }

        let mut total = 0;
        for member in 0..3 {
            let messages = store
                .get_category_messages(
                    "default",
                    &Category::new("order").unwrap(),
                    &GetCategoryMessagesOpts {
                        consumer_group_member: Some(member),
                        consumer_group_size: Some(3),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            total += messages.len();
        }
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn namespace_lifecycle() {
        let (store, _dir) = open_store().await;
        store
            .create_namespace("tenant", TOKEN_HASH, Some("a tenant"))
            .await
            .unwrap();

        let err = store
            .create_namespace("tenant", TOKEN_HASH, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamespaceExists(_)));

        let listed = store.list_namespaces().await.unwrap();
        assert_eq!(listed.len(), 2);

        store
            .write_message(
                "tenant",
                &StreamName::new("order-1").unwrap(),
                "Placed",
                &json!({}),
                &WriteMessageOpts::default(),
            )
            .await
            .unwrap();

        assert_eq!(store.delete_namespace("tenant").await.unwrap(), 1);
        let err = store.get_namespace("tenant").await.unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound(_)));
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let (store, _dir) = open_store().await;
        store.create_namespace("b", TOKEN_HASH, None).await.unwrap();
        write(&store, "acct-1", "X").await;

        let stream = StreamName::new("acct-1").unwrap();
        assert_eq!(store.stream_version("b", &stream).await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_message_with_type_filter() {
        let (store, _dir) = open_store().await;
        write(&store, "acct-9", "Opened").await;
        write(&store, "acct-9", "Deposited").await;

        let stream = StreamName::new("acct-9").unwrap();
        let last = store
            .get_last_stream_message("default", &stream, Some("Opened"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.position, 0);
    }
}
