//! Embedded KV backend on sled.
//!
//! One `sled::Db` holds everything. The namespace registry is a dedicated
//! tree; each namespace owns three trees: the message log (keyed by global
//! position), a stream index (stream name + position, pointing into the
//! log), and the registry row is what makes either visible. A write inserts
//! the log entry and the index entry in one sled transaction, so the index
//! never references a missing message.
//!
//! Global positions come from a per-namespace counter recovered from the
//! highest log key at open time. Positions reserved by writes that later
//! abort leave gaps; the counter never goes backwards.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use eventodb::error::{Error, Result};
use eventodb::namespace::{validate_namespace_id, Namespace, NamespaceStats};
use eventodb::store::{
    effective_batch_size, GetCategoryMessagesOpts, GetStreamMessagesOpts, Store, StoreHealth,
    WriteMessageOpts, WrittenMessage,
};
use eventodb::stream_name::{Category, StreamName};
use eventodb::Message;
use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

const REGISTRY_TREE: &str = "eventodb:registry";

/// Key separator between a stream name and its position in the stream
/// index. Stream names never contain NUL, so prefixes cannot collide.
const STREAM_KEY_SEPARATOR: u8 = 0;

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    registry: Tree,
    handles: Arc<RwLock<HashMap<String, Arc<NamespaceTrees>>>>,
    category_locks: Arc<DashMap<(String, String), Arc<Mutex<()>>>>,
}

struct NamespaceTrees {
    log: Tree,
    streams: Tree,
    /// Last assigned global position. Recovered from the log on open.
    last_global: AtomicU64,
}

fn stream_prefix(stream_name: &StreamName<'_>) -> Vec<u8> {
    let name: &[u8] = stream_name.as_ref();
    let mut prefix = Vec::with_capacity(name.len() + 1);
    prefix.extend_from_slice(name);
    prefix.push(STREAM_KEY_SEPARATOR);
    prefix
}

fn stream_key(stream_name: &StreamName<'_>, position: i64) -> Vec<u8> {
    let mut key = stream_prefix(stream_name);
    key.extend_from_slice(&(position as u64).to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::backend(anyhow::anyhow!("malformed 8-byte key")))?;
    Ok(u64::from_be_bytes(arr))
}

fn decode_message(bytes: &[u8]) -> Result<Message<'static>> {
    serde_cbor::from_slice(bytes).map_err(Error::backend)
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(Error::backend)?;
        Self::new(db)
    }

    pub fn new(db: Db) -> Result<Self> {
        let registry = db.open_tree(REGISTRY_TREE).map_err(Error::backend)?;
        Ok(SledStore {
            db,
            registry,
            handles: Arc::new(RwLock::new(HashMap::new())),
            category_locks: Arc::new(DashMap::new()),
        })
    }

    fn registry_record(&self, id: &str) -> Result<Namespace> {
        self.registry
            .get(id)
            .map_err(Error::backend)?
            .map(|bytes| serde_cbor::from_slice(&bytes).map_err(Error::backend))
            .transpose()?
            .ok_or_else(|| Error::NamespaceNotFound(id.to_string()))
    }

    /// Per-namespace tree handles, lazily opened and cached behind a
    /// read-write lock with a double-checked insert on the write path.
    async fn namespace_trees(&self, namespace: &str) -> Result<Arc<NamespaceTrees>> {
        {
            let handles = self.handles.read().await;
            if let Some(trees) = handles.get(namespace) {
                return Ok(trees.clone());
            }
        }

        self.registry_record(namespace)?;

        let mut handles = self.handles.write().await;
        if let Some(trees) = handles.get(namespace) {
            return Ok(trees.clone());
        }
        let trees = Arc::new(self.open_trees(namespace)?);
        handles.insert(namespace.to_string(), trees.clone());
        Ok(trees)
    }

    fn open_trees(&self, namespace: &str) -> Result<NamespaceTrees> {
        let log = self
            .db
            .open_tree(format!("ns/{namespace}/log"))
            .map_err(Error::backend)?;
        let streams = self
            .db
            .open_tree(format!("ns/{namespace}/streams"))
            .map_err(Error::backend)?;
        let last_global = log
            .last()
            .map_err(Error::backend)?
            .map(|(key, _)| decode_u64(&key))
            .transpose()?
            .unwrap_or(0);

        Ok(NamespaceTrees {
            log,
            streams,
            last_global: AtomicU64::new(last_global),
        })
    }

    fn category_lock(&self, namespace: &str, category: &Category<'_>) -> Arc<Mutex<()>> {
        let key = (namespace.to_string(), category.to_string());
        self.category_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn stream_version_in(trees: &NamespaceTrees, stream_name: &StreamName<'_>) -> Result<Option<i64>> {
        trees
            .streams
            .scan_prefix(stream_prefix(stream_name))
            .keys()
            .next_back()
            .transpose()
            .map_err(Error::backend)?
            .map(|key| {
                let position = decode_u64(&key[key.len() - 8..])?;
                Ok(position as i64)
            })
            .transpose()
    }

    fn message_at(trees: &NamespaceTrees, global: u64) -> Result<Message<'static>> {
        let bytes = trees
            .log
            .get(global.to_be_bytes().to_vec())
            .map_err(Error::backend)?
            .ok_or_else(|| {
                Error::backend(anyhow::anyhow!("stream index references missing message {global}"))
            })?;
        decode_message(&bytes)
    }
}

#[async_trait]
impl Store for SledStore {
    async fn write_message(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        msg_type: &str,
        data: &Value,
        opts: &WriteMessageOpts<'_>,
    ) -> Result<WrittenMessage> {
        let trees = self.namespace_trees(namespace).await?;
        let lock = self.category_lock(namespace, &stream_name.category());
        let _guard = lock.lock().await;

        let version = Self::stream_version_in(&trees, stream_name)?.unwrap_or(-1);
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
        let global = trees.last_global.fetch_add(1, Ordering::SeqCst) + 1;
        let time = Utc::now();
        let message = Message {
            id: opts.id.unwrap_or_else(Uuid::new_v4),
            stream_name: stream_name.as_borrowed(),
            msg_type: Cow::Borrowed(msg_type),
            position,
            global_position: global as i64,
            data: Cow::Borrowed(data),
            metadata: opts.metadata.map(Cow::Borrowed),
            time,
        };

        (&trees.log, &trees.streams)
            .transaction(|(tx_log, tx_streams)| {
                let encoded = serde_cbor::to_vec(&message)
                    .map_err(|err| ConflictableTransactionError::Abort(Error::backend(err)))?;
                tx_log.insert(global.to_be_bytes().to_vec(), encoded)?;
                tx_streams.insert(
                    stream_key(stream_name, position),
                    global.to_be_bytes().to_vec(),
                )?;
                tx_log.flush();
                tx_streams.flush();
                Ok(())
            })
            .map_err(|err| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => Error::backend(err),
            })?;

        info!(
            namespace,
            stream_name = %stream_name,
            msg_type,
            position,
            global_position = global,
            "message written"
        );

        Ok(WrittenMessage {
            position,
            global_position: global as i64,
            time,
        })
    }

    async fn get_stream_messages(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        opts: &GetStreamMessagesOpts,
    ) -> Result<Vec<Message<'static>>> {
        let trees = self.namespace_trees(namespace).await?;

        let position = opts.position.unwrap_or(0).max(0);
        let global_position = opts.global_position.unwrap_or(0);
        let batch = effective_batch_size(opts.batch_size);
        if batch == Some(0) {
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        for entry in trees.streams.range(stream_key(stream_name, position)..) {
            let (key, value) = entry.map_err(Error::backend)?;
            if !key.starts_with(&stream_prefix(stream_name)) {
                break;
            }
            let message = Self::message_at(&trees, decode_u64(&value)?)?;
            if message.global_position < global_position {
                continue;
            }
            messages.push(message);
            if batch.is_some_and(|n| messages.len() >= n) {
                break;
            }
        }

        Ok(messages)
    }

    async fn get_category_messages(
        &self,
        namespace: &str,
        category: &Category<'_>,
        opts: &GetCategoryMessagesOpts<'_>,
    ) -> Result<Vec<Message<'static>>> {
        let trees = self.namespace_trees(namespace).await?;

        let position = opts.position.unwrap_or(1).max(1) as u64;
        let batch = effective_batch_size(opts.batch_size);
        if batch == Some(0) {
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        for entry in trees.log.range(position.to_be_bytes().to_vec()..) {
            let (_, value) = entry.map_err(Error::backend)?;
            let message = decode_message(&value)?;
            if message.stream_name.category() != *category
                || !opts.correlation_matches(&message)
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
        let trees = self.namespace_trees(namespace).await?;

        for entry in trees.streams.scan_prefix(stream_prefix(stream_name)).rev() {
            let (_, value) = entry.map_err(Error::backend)?;
            let message = Self::message_at(&trees, decode_u64(&value)?)?;
            if msg_type.map_or(true, |t| message.msg_type == t) {
                return Ok(Some(message));
            }
        }

        Ok(None)
    }

    async fn stream_version(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
    ) -> Result<Option<i64>> {
        let trees = self.namespace_trees(namespace).await?;
        Self::stream_version_in(&trees, stream_name)
    }

    async fn create_namespace(
        &self,
        id: &str,
        token_hash: &str,
        description: Option<&str>,
    ) -> Result<Namespace> {
        validate_namespace_id(id)?;

        let record = Namespace {
            id: id.to_string(),
            token_hash: token_hash.to_string(),
            description: description.map(str::to_string),
            created_at: Utc::now(),
        };
        let encoded = serde_cbor::to_vec(&record).map_err(Error::backend)?;

        // Container first, registry row last: a row never points at trees
        // that do not exist, and orphan trees from an interrupted create are
        // invisible until the next create claims them.
        self.open_trees(id)?;
        self.registry
            .compare_and_swap(id, None as Option<&[u8]>, Some(encoded))
            .map_err(Error::backend)?
            .map_err(|_| Error::NamespaceExists(id.to_string()))?;
        self.registry.flush_async().await.map_err(Error::backend)?;

        info!(namespace = id, "namespace created");

        Ok(record)
    }

    async fn delete_namespace(&self, id: &str) -> Result<i64> {
        let trees = self.namespace_trees(id).await?;
        let deleted = trees.log.len() as i64;

        // Registry row goes first; it is authoritative, so the data is gone
        // the moment the row is.
        self.registry
            .remove(id)
            .map_err(Error::backend)?
            .ok_or_else(|| Error::NamespaceNotFound(id.to_string()))?;
        self.registry.flush_async().await.map_err(Error::backend)?;

        self.handles.write().await.remove(id);
        self.category_locks.retain(|(ns, _), _| ns != id);
        self.db
            .drop_tree(format!("ns/{id}/log"))
            .map_err(Error::backend)?;
        self.db
            .drop_tree(format!("ns/{id}/streams"))
            .map_err(Error::backend)?;

        info!(namespace = id, messages_deleted = deleted, "namespace deleted");

        Ok(deleted)
    }

    async fn get_namespace(&self, id: &str) -> Result<Namespace> {
        self.registry_record(id)
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let mut namespaces = Vec::new();
        for entry in self.registry.iter() {
            let (_, value) = entry.map_err(Error::backend)?;
            namespaces.push(serde_cbor::from_slice(&value).map_err(Error::backend)?);
        }
        Ok(namespaces)
    }

    async fn namespace_stats(&self, id: &str) -> Result<NamespaceStats> {
        let trees = self.namespace_trees(id).await?;
        let last = trees
            .log
            .last()
            .map_err(Error::backend)?
            .map(|(key, _)| decode_u64(&key))
            .transpose()?;

        Ok(NamespaceStats {
            message_count: trees.log.len() as i64,
            last_global_position: last.map(|g| g as i64),
        })
    }

    async fn health(&self) -> Result<StoreHealth> {
        let handles = self.handles.read().await;
        Ok(StoreHealth {
            backend: "sled",
            connections: handles.len() as u32,
        })
    }
}
