//! The store contract. Backends provide per-namespace isolated storage with
//! gapless per-stream positions, a monotonic per-namespace global position,
//! and optimistic concurrency on writes.
//!
//! Writes to streams in one category serialize through an exclusive
//! per-category lock; reads take no lock. The exact locking primitive is the
//! backend's choice (advisory locks, in-process mutex map), but the contract
//! is the same everywhere: serializable updates within a category, lock-free
//! progress across categories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::message::Message;
use crate::namespace::{Namespace, NamespaceStats};
use crate::stream_name::{Category, StreamName};

/// Default number of messages returned by a read when the caller does not
/// say otherwise.
pub const DEFAULT_BATCH_SIZE: i64 = 1000;

/// Batch-size sentinel meaning "no limit".
pub const UNLIMITED_BATCH_SIZE: i64 = -1;

/// Expected-version sentinel meaning "the stream must not exist yet".
pub const NO_STREAM: i64 = -1;

/// Options for [`Store::write_message`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteMessageOpts<'a> {
    /// Message id. Generated when absent.
    pub id: Option<Uuid>,
    pub metadata: Option<&'a Value>,
    /// Optimistic concurrency check: the stream's version immediately before
    /// the write must equal this value. [`NO_STREAM`] asserts the stream is
    /// empty.
    pub expected_version: Option<i64>,
}

/// Options for [`Store::get_stream_messages`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetStreamMessagesOpts {
    /// Lowest stream position to return. Defaults to 0.
    pub position: Option<i64>,
    /// Alternative anchor: lowest global position to return.
    pub global_position: Option<i64>,
    /// [`UNLIMITED_BATCH_SIZE`] returns the whole tail.
    pub batch_size: Option<i64>,
}

/// Options for [`Store::get_category_messages`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetCategoryMessagesOpts<'a> {
    /// Lowest global position to return. Defaults to 1.
    pub position: Option<i64>,
    pub batch_size: Option<i64>,
    /// Only messages whose `correlationStreamName` metadata belongs to this
    /// category.
    pub correlation: Option<&'a str>,
    /// Consumer-group filter; both present or both absent. Applied after the
    /// correlation filter, and `batch_size` is honored after both.
    pub consumer_group_member: Option<i64>,
    pub consumer_group_size: Option<i64>,
}

impl GetCategoryMessagesOpts<'_> {
    /// Whether `stream_name` belongs to the requested consumer-group member.
    pub fn consumer_group_matches(&self, stream_name: &StreamName<'_>) -> bool {
        match (self.consumer_group_member, self.consumer_group_size) {
            (Some(member), Some(size)) => {
                crate::stream_name::consumer_member(stream_name, size) == member
            }
            _ => true,
        }
    }

    /// Whether a message passes the correlation filter.
    pub fn correlation_matches(&self, message: &Message<'_>) -> bool {
        match self.correlation {
            Some(correlation) => message
                .correlation_stream_name()
                .map(|name| name.category() == correlation)
                .unwrap_or(false),
            None => true,
        }
    }
}

/// Result of a successful write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WrittenMessage {
    pub position: i64,
    pub global_position: i64,
    /// Commit time stamped by the backend.
    pub time: DateTime<Utc>,
}

/// Backend liveness for `sys.health`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreHealth {
    pub backend: &'static str,
    pub connections: u32,
}

/// Per-namespace isolated message storage.
///
/// Implementations never retry internally (with the single exception of the
/// namespace-creation visibility window) and never swallow version
/// conflicts; those are reported to the caller with the observed version.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Write a message to a stream, assigning the next stream position and
    /// the next namespace-wide global position.
    async fn write_message(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        msg_type: &str,
        data: &Value,
        opts: &WriteMessageOpts<'_>,
    ) -> Result<WrittenMessage>;

    /// Messages of one stream with `position >= opts.position`, ordered by
    /// position ascending.
    async fn get_stream_messages(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        opts: &GetStreamMessagesOpts,
    ) -> Result<Vec<Message<'static>>>;

    /// Messages of every stream in a category with `global_position >=
    /// opts.position`, ordered by global position ascending.
    async fn get_category_messages(
        &self,
        namespace: &str,
        category: &Category<'_>,
        opts: &GetCategoryMessagesOpts<'_>,
    ) -> Result<Vec<Message<'static>>>;

    /// The stream's newest message, optionally restricted to a message type.
    async fn get_last_stream_message(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        msg_type: Option<&str>,
    ) -> Result<Option<Message<'static>>>;

    /// Highest position in the stream, `None` when the stream has no
    /// messages.
    async fn stream_version(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
    ) -> Result<Option<i64>>;

    /// Create a namespace and its physical container atomically.
    async fn create_namespace(
        &self,
        id: &str,
        token_hash: &str,
        description: Option<&str>,
    ) -> Result<Namespace>;

    /// Drop a namespace's container and registry entry atomically. Returns
    /// the number of messages deleted with it.
    async fn delete_namespace(&self, id: &str) -> Result<i64>;

    async fn get_namespace(&self, id: &str) -> Result<Namespace>;

    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;

    async fn namespace_stats(&self, id: &str) -> Result<NamespaceStats>;

    async fn health(&self) -> Result<StoreHealth>;
}

/// Resolves read options shared by every backend: anchor position and
/// effective batch size (`None` = unlimited).
pub fn effective_batch_size(batch_size: Option<i64>) -> Option<usize> {
    match batch_size {
        Some(UNLIMITED_BATCH_SIZE) => None,
        Some(n) if n >= 0 => Some(n as usize),
        Some(_) => Some(0),
        None => Some(DEFAULT_BATCH_SIZE as usize),
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use chrono::Utc;
    use serde_json::json;

    use super::*;

    #[test]
    fn batch_size_resolution() {
        assert_eq!(effective_batch_size(None), Some(1000));
        assert_eq!(effective_batch_size(Some(10)), Some(10));
        assert_eq!(effective_batch_size(Some(0)), Some(0));
        assert_eq!(effective_batch_size(Some(-1)), None);
    }

    #[test]
    fn category_filters() {
        let msg = Message {
            id: Uuid::new_v4(),
            stream_name: StreamName::new("order-1").unwrap(),
            msg_type: Cow::Borrowed("Placed"),
            position: 0,
            global_position: 1,
            data: Cow::Owned(json!({})),
            metadata: Some(Cow::Owned(json!({
                "correlationStreamName": "checkout-9"
            }))),
            time: Utc::now(),
        };

        let opts = GetCategoryMessagesOpts {
            correlation: Some("checkout"),
            ..Default::default()
        };
        assert!(opts.correlation_matches(&msg));

        let opts = GetCategoryMessagesOpts {
            correlation: Some("billing"),
            ..Default::default()
        };
        assert!(!opts.correlation_matches(&msg));

        // member for id "1" with size 3 is 0
        let opts = GetCategoryMessagesOpts {
            consumer_group_member: Some(0),
            consumer_group_size: Some(3),
            ..Default::default()
        };
        assert!(opts.consumer_group_matches(&msg.stream_name));

        let opts = GetCategoryMessagesOpts {
            consumer_group_member: Some(1),
            consumer_group_size: Some(3),
            ..Default::default()
        };
        assert!(!opts.consumer_group_matches(&msg.stream_name));
    }
}
