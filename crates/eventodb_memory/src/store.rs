//! In-process backend. Backs `--test-mode`: no durability, but the same
//! contract as the persistent backends, including per-category write
//! serialization and namespace isolation.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

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
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct MemoryStore {
    namespaces: Arc<RwLock<HashMap<String, Arc<NamespaceData>>>>,
    category_locks: Arc<DashMap<(String, String), Arc<Mutex<()>>>>,
}

struct NamespaceData {
    record: Namespace,
    inner: StdMutex<NamespaceInner>,
}

#[derive(Default)]
struct NamespaceInner {
    /// All messages in commit order; index i holds global position i + 1.
    log: Vec<Message<'static>>,
    /// Stream name -> log indexes, in position order.
    streams: HashMap<String, Vec<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, id: &str) -> Result<Arc<NamespaceData>> {
        self.namespaces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(id.to_string()))
    }

    fn category_lock(&self, namespace: &str, category: &Category<'_>) -> Arc<Mutex<()>> {
        let key = (namespace.to_string(), category.to_string());
        self.category_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn write_message(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        msg_type: &str,
        data: &Value,
        opts: &WriteMessageOpts<'_>,
    ) -> Result<WrittenMessage> {
        let ns = self.namespace(namespace)?;
        let lock = self.category_lock(namespace, &stream_name.category());
        let _guard = lock.lock().await;

        let mut inner = ns.inner.lock().unwrap_or_else(|e| e.into_inner());
        let indexes = inner.streams.get(stream_name.as_str());
        let version = indexes.map_or(-1, |idx| idx.len() as i64 - 1);

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
        let global_position = inner.log.len() as i64 + 1;
        let time = Utc::now();
        let message = Message {
            id: opts.id.unwrap_or_else(Uuid::new_v4),
            stream_name: stream_name.as_borrowed().into_owned(),
            msg_type: Cow::Owned(msg_type.to_string()),
            position,
            global_position,
            data: Cow::Owned(data.clone()),
            metadata: opts.metadata.map(|m| Cow::Owned(m.clone())),
            time,
        };

        let index = inner.log.len();
        inner.log.push(message);
        inner
            .streams
            .entry(stream_name.to_string())
            .or_default()
            .push(index);

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
        let ns = self.namespace(namespace)?;
        let inner = ns.inner.lock().unwrap_or_else(|e| e.into_inner());

        let position = opts.position.unwrap_or(0);
        let global_position = opts.global_position.unwrap_or(0);
        let batch = effective_batch_size(opts.batch_size);

        let messages = inner
            .streams
            .get(stream_name.as_str())
            .map(|indexes| {
                let from = position.max(0) as usize;
                let iter = indexes
                    .iter()
                    .skip(from)
                    .map(|&i| &inner.log[i])
                    .filter(|msg| msg.global_position >= global_position)
                    .cloned();
                match batch {
                    Some(n) => iter.take(n).collect(),
                    None => iter.collect(),
                }
            })
            .unwrap_or_default();

        Ok(messages)
    }

    async fn get_category_messages(
        &self,
        namespace: &str,
        category: &Category<'_>,
        opts: &GetCategoryMessagesOpts<'_>,
    ) -> Result<Vec<Message<'static>>> {
        let ns = self.namespace(namespace)?;
        let inner = ns.inner.lock().unwrap_or_else(|e| e.into_inner());

        let position = opts.position.unwrap_or(1).max(1);
        let batch = effective_batch_size(opts.batch_size);

        // Global positions are dense here, so the anchor is an index.
        let from = (position - 1) as usize;
        let iter = inner
            .log
            .iter()
            .skip(from)
            .filter(|msg| msg.stream_name.category() == *category)
            .filter(|msg| opts.correlation_matches(msg))
            .filter(|msg| opts.consumer_group_matches(&msg.stream_name))
            .cloned();
        let messages = match batch {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        };

        Ok(messages)
    }

    async fn get_last_stream_message(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        msg_type: Option<&str>,
    ) -> Result<Option<Message<'static>>> {
        let ns = self.namespace(namespace)?;
        let inner = ns.inner.lock().unwrap_or_else(|e| e.into_inner());

        let message = inner
            .streams
            .get(stream_name.as_str())
            .and_then(|indexes| {
                indexes
                    .iter()
                    .rev()
                    .map(|&i| &inner.log[i])
                    .find(|msg| msg_type.map_or(true, |t| msg.msg_type == t))
            })
            .cloned();

        Ok(message)
    }

    async fn stream_version(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
    ) -> Result<Option<i64>> {
        let ns = self.namespace(namespace)?;
        let inner = ns.inner.lock().unwrap_or_else(|e| e.into_inner());

        Ok(inner
            .streams
            .get(stream_name.as_str())
            .map(|indexes| indexes.len() as i64 - 1))
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

        let mut namespaces = self.namespaces.write().unwrap_or_else(|e| e.into_inner());
        if namespaces.contains_key(id) {
            return Err(Error::NamespaceExists(id.to_string()));
        }
        namespaces.insert(
            id.to_string(),
            Arc::new(NamespaceData {
                record: record.clone(),
                inner: StdMutex::new(NamespaceInner::default()),
            }),
        );

        info!(namespace = id, "namespace created");

        Ok(record)
    }

    async fn delete_namespace(&self, id: &str) -> Result<i64> {
        let removed = self
            .namespaces
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| Error::NamespaceNotFound(id.to_string()))?;
        self.category_locks.retain(|(ns, _), _| ns != id);

        let deleted = removed.inner.lock().unwrap_or_else(|e| e.into_inner()).log.len() as i64;
        info!(namespace = id, messages_deleted = deleted, "namespace deleted");

        Ok(deleted)
    }

    async fn get_namespace(&self, id: &str) -> Result<Namespace> {
        Ok(self.namespace(id)?.record.clone())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let mut namespaces: Vec<_> = self
            .namespaces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|ns| ns.record.clone())
            .collect();
        namespaces.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(namespaces)
    }

    async fn namespace_stats(&self, id: &str) -> Result<NamespaceStats> {
        let ns = self.namespace(id)?;
        let inner = ns.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(NamespaceStats {
            message_count: inner.log.len() as i64,
            last_global_position: inner.log.last().map(|msg| msg.global_position),
        })
    }

    async fn health(&self) -> Result<StoreHealth> {
        let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
        Ok(StoreHealth {
            backend: "memory",
            connections: namespaces.len() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const TOKEN_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    async fn store_with_default() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_namespace("default", TOKEN_HASH, None)
            .await
            .unwrap();
        store
    }

    async fn write(store: &MemoryStore, ns: &str, stream: &str, msg_type: &str) -> WrittenMessage {
        store
            .write_message(
                ns,
                &StreamName::new(stream).unwrap(),
                msg_type,
                &json!({}),
                &WriteMessageOpts::default(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sequential_positions_are_gapless() {
        let store = store_with_default().await;
        for _ in 0..3 {
            write(&store, "default", "account-1", "A").await;
        }

        let version = store
            .stream_version("default", &StreamName::new("account-1").unwrap())
            .await
            .unwrap();
        assert_eq!(version, Some(2));

        let messages = store
            .get_stream_messages(
                "default",
                &StreamName::new("account-1").unwrap(),
                &GetStreamMessagesOpts {
                    batch_size: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let positions: Vec<i64> = messages.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn expected_version_conflict_reports_actual_and_does_not_persist() {
        let store = store_with_default().await;
        write(&store, "default", "account-2", "B").await;

        let err = store
            .write_message(
                "default",
                &StreamName::new("account-2").unwrap(),
                "B",
                &json!({}),
                &WriteMessageOpts {
                    expected_version: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        match err {
            Error::WrongExpectedVersion {
                expected, actual, ..
            } => {
                assert_eq!(expected, 5);
                assert_eq!(actual, 0);
            }
            other => panic!("unexpected error: {other}"),
        }

        let version = store
            .stream_version("default", &StreamName::new("account-2").unwrap())
            .await
            .unwrap();
        assert_eq!(version, Some(0));
    }

    #[tokio::test]
    async fn expected_version_no_stream() {
        let store = store_with_default().await;

        let stream = StreamName::new("fresh-1").unwrap();
        let opts = WriteMessageOpts {
            expected_version: Some(-1),
            ..Default::default()
        };
        store
            .write_message("default", &stream, "X", &json!({}), &opts)
            .await
            .unwrap();

        // Stream exists now, -1 must conflict.
        let err = store
            .write_message("default", &stream, "X", &json!({}), &opts)
            .await
            .unwrap_err();
        match err {
            Error::WrongExpectedVersion { actual, .. } => assert_eq!(actual, 0),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn category_read_spans_streams_in_global_order() {
        let store = store_with_default().await;
        write(&store, "default", "order-1", "Placed").await;
        write(&store, "default", "order-2", "Placed").await;
        write(&store, "default", "order-3", "Placed").await;
        write(&store, "default", "account-1", "Opened").await;

        let messages = store
            .get_category_messages(
                "default",
                &Category::new("order").unwrap(),
                &GetCategoryMessagesOpts {
                    batch_size: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(messages.len(), 3);
        let globals: Vec<i64> = messages.iter().map(|m| m.global_position).collect();
        assert!(globals.windows(2).all(|w| w[0] < w[1]));
        let streams: Vec<&str> = messages.iter().map(|m| m.stream_name.as_ref()).collect();
        assert_eq!(streams, vec!["order-1", "order-2", "order-3"]);
    }

    #[tokio::test]
    async fn consumer_groups_partition_disjointly() {
        let store = store_with_default().await;
        for n in 1..=10 {
            write(&store, "default", &format!("order-{n}"), "Placed").await;
        }

        let mut seen = Vec::new();
        for member in 0..3 {
            let messages = store
                .get_category_messages(
                    "default",
                    &Category::new("order").unwrap(),
                    &GetCategoryMessagesOpts {
                        consumer_group_member: Some(member),
                        consumer_group_size: Some(3),
                        batch_size: Some(100),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            for msg in &messages {
                assert!(
                    !seen.contains(&msg.global_position),
                    "message delivered to two members"
                );
                seen.push(msg.global_position);
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn correlation_filters_by_originating_category() {
        let store = store_with_default().await;
        let stream = StreamName::new("order-1").unwrap();
        let correlated = json!({ "correlationStreamName": "checkout-7" });
        store
            .write_message(
                "default",
                &stream,
                "Placed",
                &json!({}),
                &WriteMessageOpts {
                    metadata: Some(&correlated),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        write(&store, "default", "order-2", "Placed").await;

        let messages = store
            .get_category_messages(
                "default",
                &Category::new("order").unwrap(),
                &GetCategoryMessagesOpts {
                    correlation: Some("checkout"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].stream_name, "order-1");
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = store_with_default().await;
        store.create_namespace("b", TOKEN_HASH, None).await.unwrap();

        write(&store, "default", "acct-1", "X").await;

        let stream = StreamName::new("acct-1").unwrap();
        let in_a = store
            .get_stream_messages("default", &stream, &GetStreamMessagesOpts::default())
            .await
            .unwrap();
        let in_b = store
            .get_stream_messages("b", &stream, &GetStreamMessagesOpts::default())
            .await
            .unwrap();
        assert_eq!(in_a.len(), 1);
        assert_eq!(in_b.len(), 0);
    }

    #[tokio::test]
    async fn global_position_is_strictly_increasing_across_categories() {
        let store = store_with_default().await;
        write(&store, "default", "order-1", "A").await;
        write(&store, "default", "account-1", "B").await;
        write(&store, "default", "order-2", "C").await;

        let mut all = Vec::new();
        for category in ["order", "account"] {
            let messages = store
                .get_category_messages(
                    "default",
                    &Category::new(category).unwrap(),
                    &GetCategoryMessagesOpts::default(),
                )
                .await
                .unwrap();
            all.extend(messages.into_iter().map(|m| m.global_position));
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn last_message_honors_type_filter() {
        let store = store_with_default().await;
        write(&store, "default", "acct-9", "Opened").await;
        write(&store, "default", "acct-9", "Deposited").await;
        write(&store, "default", "acct-9", "Opened").await;

        let stream = StreamName::new("acct-9").unwrap();
        let last = store
            .get_last_stream_message("default", &stream, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.position, 2);

        let last_deposit = store
            .get_last_stream_message("default", &stream, Some("Deposited"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last_deposit.position, 1);

        let none = store
            .get_last_stream_message("default", &stream, Some("Closed"))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn delete_namespace_reports_message_count() {
        let store = store_with_default().await;
        write(&store, "default", "order-1", "A").await;
        write(&store, "default", "order-2", "B").await;

        let deleted = store.delete_namespace("default").await.unwrap();
        assert_eq!(deleted, 2);

        let err = store.delete_namespace("default").await.unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_namespace_errors() {
        let store = MemoryStore::new();
        let err = store
            .stream_version("ghost", &StreamName::new("s-1").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound(_)));
    }

    #[tokio::test]
    async fn create_existing_namespace_errors() {
        let store = store_with_default().await;
        let err = store
            .create_namespace("default", TOKEN_HASH, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamespaceExists(_)));
    }
}
