//! In-process notification fanout. One `Poke` per committed write, delivered
//! to stream and category subscribers.
//!
//! This is a notification layer, not a durable queue: a subscriber whose
//! sink is full misses the poke and catches up by reading the store from its
//! last seen global position. Publishers never block on a slow sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use eventodb::stream_name::{consumer_member, StreamName};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Buffered pokes per subscriber before drops start.
const SINK_CAPACITY: usize = 64;

/// A lightweight notification that a message committed, carrying enough
/// position data for the subscriber to fetch it.
#[derive(Clone, Debug, PartialEq)]
pub struct Poke {
    pub namespace: String,
    pub stream_name: String,
    pub position: i64,
    pub global_position: i64,
    pub time: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerGroup {
    pub member: i64,
    pub size: i64,
}

struct Subscriber {
    id: u64,
    sink: mpsc::Sender<Poke>,
    group: Option<ConsumerGroup>,
}

type TopicKey = (String, String);

#[derive(Default)]
struct Registries {
    streams: HashMap<TopicKey, Vec<Subscriber>>,
    categories: HashMap<TopicKey, Vec<Subscriber>>,
}

#[derive(Default)]
struct HubInner {
    registries: RwLock<Registries>,
    next_id: AtomicU64,
}

/// Process-wide pubsub hub. Publishers take the read lock, subscribe and
/// unsubscribe take the write lock.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<HubInner>,
}

enum TopicKind {
    Stream,
    Category,
}

/// A live registration. Dropping it unregisters the subscriber and prunes
/// its topic if that leaves the topic empty.
pub struct Subscription {
    hub: Hub,
    kind: TopicKind,
    key: TopicKey,
    id: u64,
    pub receiver: mpsc::Receiver<Poke>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.kind, &self.key, self.id);
    }
}

impl Hub {
    pub fn new() -> Self {
        Hub::default()
    }

    pub fn subscribe_stream(&self, namespace: &str, stream_name: &str) -> Subscription {
        self.subscribe(
            TopicKind::Stream,
            (namespace.to_string(), stream_name.to_string()),
            None,
        )
    }

    pub fn subscribe_category(
        &self,
        namespace: &str,
        category: &str,
        group: Option<ConsumerGroup>,
    ) -> Subscription {
        self.subscribe(
            TopicKind::Category,
            (namespace.to_string(), category.to_string()),
            group,
        )
    }

    fn subscribe(&self, kind: TopicKind, key: TopicKey, group: Option<ConsumerGroup>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sink, receiver) = mpsc::channel(SINK_CAPACITY);
        let subscriber = Subscriber { id, sink, group };

        let mut registries = self
            .inner
            .registries
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let topics = match kind {
            TopicKind::Stream => &mut registries.streams,
            TopicKind::Category => &mut registries.categories,
        };
        topics.entry(key.clone()).or_default().push(subscriber);

        trace!(namespace = %key.0, topic = %key.1, id, "subscribed");

        Subscription {
            hub: self.clone(),
            kind,
            key,
            id,
            receiver,
        }
    }

    fn unsubscribe(&self, kind: &TopicKind, key: &TopicKey, id: u64) {
        let mut registries = self
            .inner
            .registries
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let topics = match kind {
            TopicKind::Stream => &mut registries.streams,
            TopicKind::Category => &mut registries.categories,
        };
        if let Some(subscribers) = topics.get_mut(key) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                topics.remove(key);
            }
        }

        trace!(namespace = %key.0, topic = %key.1, id, "unsubscribed");
    }

    /// Fans a poke out to the stream topic and, group filter permitting, the
    /// category topic. Pokes to full or closed sinks are dropped; closed
    /// sinks are pruned afterwards.
    pub fn publish(&self, poke: &Poke) {
        let Ok(stream_name) = StreamName::new(poke.stream_name.as_str()) else {
            return;
        };
        let category = stream_name.category().to_string();

        let mut dead = Vec::new();
        {
            let registries = self
                .inner
                .registries
                .read()
                .unwrap_or_else(|e| e.into_inner());

            let stream_key = (poke.namespace.clone(), poke.stream_name.clone());
            if let Some(subscribers) = registries.streams.get(&stream_key) {
                for subscriber in subscribers {
                    deliver(subscriber, poke, &mut dead, TopicKind::Stream, &stream_key);
                }
            }

            let category_key = (poke.namespace.clone(), category);
            if let Some(subscribers) = registries.categories.get(&category_key) {
                for subscriber in subscribers {
                    let accepts = subscriber.group.map_or(true, |group| {
                        consumer_member(&stream_name, group.size) == group.member
                    });
                    if accepts {
                        deliver(subscriber, poke, &mut dead, TopicKind::Category, &category_key);
                    }
                }
            }
        }

        for (kind, key, id) in dead {
            self.unsubscribe(&kind, &key, id);
        }
    }

    /// Number of live subscribers across all topics.
    pub fn subscriber_count(&self) -> usize {
        let registries = self
            .inner
            .registries
            .read()
            .unwrap_or_else(|e| e.into_inner());
        registries.streams.values().map(Vec::len).sum::<usize>()
            + registries.categories.values().map(Vec::len).sum::<usize>()
    }

    /// Drops every subscriber sink, ending all subscription streams. Used at
    /// shutdown so SSE connections drain instead of lingering.
    pub fn close_all(&self) {
        let mut registries = self
            .inner
            .registries
            .write()
            .unwrap_or_else(|e| e.into_inner());
        registries.streams.clear();
        registries.categories.clear();
    }
}

fn deliver(
    subscriber: &Subscriber,
    poke: &Poke,
    dead: &mut Vec<(TopicKind, TopicKey, u64)>,
    kind: TopicKind,
    key: &TopicKey,
) {
    match subscriber.sink.try_send(poke.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(
                namespace = %poke.namespace,
                stream_name = %poke.stream_name,
                subscriber = subscriber.id,
                "subscriber lagging, poke dropped"
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            dead.push((kind, key.clone(), subscriber.id));
        }
    }
}
