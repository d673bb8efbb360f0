//! The long-lived push channel. `GET /subscribe` answers with an SSE stream
//! of `poke` events for one stream or one category.
//!
//! The establishment order is a contract: resolve the target, register with
//! the hub, emit the `: ready` comment, replay the historical tail from the
//! store, then forward live pokes. Registering before the backlog read
//! closes the race in which a write commits between read and subscribe; a
//! write that lands in both is suppressed by the global-position gate.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use eventodb::store::{GetCategoryMessagesOpts, GetStreamMessagesOpts};
use eventodb::stream_name::{Category, StreamName};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::app::AppState;
use crate::auth::{AuthContext, TOKEN_HEADER};
use crate::error::RpcError;
use crate::pubsub::{ConsumerGroup, Subscription};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEP_ALIVE_TEXT: &str = "keep-alive";
const REPLAY_BATCH: i64 = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeQuery {
    stream: Option<String>,
    category: Option<String>,
    position: Option<String>,
    correlation: Option<String>,
    #[serde(rename = "consumerGroupMember")]
    consumer_group_member: Option<String>,
    #[serde(rename = "consumerGroupSize")]
    consumer_group_size: Option<String>,
    /// Consumed by the auth extractor; listed so it is not rejected here.
    #[allow(dead_code)]
    token: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Target {
    Stream {
        name: String,
        position: i64,
    },
    Category {
        name: String,
        position: i64,
        correlation: Option<String>,
        group: Option<ConsumerGroup>,
    },
}

pub async fn handle_subscribe(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<SubscribeQuery>,
) -> Response {
    let target = match resolve_target(&query) {
        Ok(target) => target,
        Err(err) => return err.into_response(),
    };

    let subscription = match &target {
        Target::Stream { name, .. } => state.hub.subscribe_stream(&auth.namespace, name),
        Target::Category { name, group, .. } => {
            state.hub.subscribe_category(&auth.namespace, name, *group)
        }
    };

    let events = poke_events(state, auth.namespace.clone(), target, subscription);
    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text(KEEP_ALIVE_TEXT),
    );

    let mut response = sse.into_response();
    if let Some(token) = &auth.announce_token {
        if let Ok(value) = axum::http::HeaderValue::from_str(token) {
            response.headers_mut().insert(TOKEN_HEADER, value);
        }
    }

    response
}

fn resolve_target(query: &SubscribeQuery) -> Result<Target, RpcError> {
    let position = parse_i64(query.position.as_deref(), "position")?.unwrap_or(0);
    if position < 0 {
        return Err(RpcError::invalid_request("position must be 0 or greater"));
    }

    let member = parse_i64(query.consumer_group_member.as_deref(), "consumerGroupMember")?;
    let size = parse_i64(query.consumer_group_size.as_deref(), "consumerGroupSize")?;
    let group = match (member, size) {
        (None, None) => None,
        (Some(member), Some(size)) if size >= 1 && (0..size).contains(&member) => {
            Some(ConsumerGroup { member, size })
        }
        _ => {
            return Err(RpcError::invalid_request(
                "consumerGroupMember and consumerGroupSize are required together, with 0 <= member < size",
            ))
        }
    };

    match (query.stream.as_deref(), query.category.as_deref()) {
        (Some(stream), None) => {
            if query.correlation.is_some() || group.is_some() {
                return Err(RpcError::invalid_request(
                    "correlation and consumer groups only apply to category subscriptions",
                ));
            }
            StreamName::new(stream)
                .map_err(|err| RpcError::invalid_request(err.to_string()))?;

            Ok(Target::Stream {
                name: stream.to_string(),
                position,
            })
        }
        (None, Some(category)) => {
            if category.contains(StreamName::ID_SEPARATOR) {
                return Err(RpcError::invalid_request(
                    "category must not contain a stream id",
                ));
            }
            Category::new(category)
                .map_err(|err| RpcError::invalid_request(err.to_string()))?;
            if query.correlation.as_deref().is_some_and(str::is_empty) {
                return Err(RpcError::invalid_request(
                    "correlation must be a non-empty string",
                ));
            }

            Ok(Target::Category {
                name: category.to_string(),
                position: position.max(1),
                correlation: query.correlation.clone(),
                group,
            })
        }
        _ => Err(RpcError::invalid_request(
            "exactly one of stream or category is required",
        )),
    }
}

fn parse_i64(value: Option<&str>, name: &str) -> Result<Option<i64>, RpcError> {
    value
        .map(|value| {
            value
                .parse()
                .map_err(|_| RpcError::invalid_request(format!("{name} must be an integer")))
        })
        .transpose()
}

/// The event stream: ready marker, replayed tail, then live pokes until the
/// client goes away (which drops `subscription` and unregisters it).
fn poke_events(
    state: AppState,
    namespace: String,
    target: Target,
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut subscription = subscription;

        yield Ok(Event::default().comment("ready"));

        let mut last_global = 0i64;
        match &target {
            Target::Stream { name, position } => {
                // Already validated during target resolution.
                let Ok(stream_name) = StreamName::new(name.as_str()) else { return };
                let mut from = *position;
                loop {
                    let batch = state
                        .store
                        .get_stream_messages(
                            &namespace,
                            &stream_name,
                            &GetStreamMessagesOpts {
                                position: Some(from),
                                batch_size: Some(REPLAY_BATCH),
                                ..Default::default()
                            },
                        )
                        .await;
                    let messages = match batch {
                        Ok(messages) => messages,
                        Err(err) => {
                            warn!(%namespace, stream = %stream_name, "subscription replay failed: {err}");
                            yield Ok(Event::default().event("error").data(err.to_string()));
                            return;
                        }
                    };

                    let full = messages.len() as i64 == REPLAY_BATCH;
                    for message in messages {
                        from = message.position + 1;
                        last_global = message.global_position;
                        yield Ok(poke_event(
                            message.stream_name.as_str(),
                            message.position,
                            message.global_position,
                        ));
                    }
                    if !full {
                        break;
                    }
                }
            }
            Target::Category { name, position, correlation, group } => {
                let Ok(category) = Category::new(name.as_str()) else { return };
                let mut from = *position;
                loop {
                    let batch = state
                        .store
                        .get_category_messages(
                            &namespace,
                            &category,
                            &GetCategoryMessagesOpts {
                                position: Some(from),
                                batch_size: Some(REPLAY_BATCH),
                                correlation: correlation.as_deref(),
                                consumer_group_member: group.map(|g| g.member),
                                consumer_group_size: group.map(|g| g.size),
                            },
                        )
                        .await;
                    let messages = match batch {
                        Ok(messages) => messages,
                        Err(err) => {
                            warn!(%namespace, category = %category, "subscription replay failed: {err}");
                            yield Ok(Event::default().event("error").data(err.to_string()));
                            return;
                        }
                    };

                    let full = messages.len() as i64 == REPLAY_BATCH;
                    for message in messages {
                        from = message.global_position + 1;
                        last_global = message.global_position;
                        yield Ok(poke_event(
                            message.stream_name.as_str(),
                            message.position,
                            message.global_position,
                        ));
                    }
                    if !full {
                        break;
                    }
                }
            }
        }

        while let Some(poke) = subscription.receiver.recv().await {
            // Pokes already covered by the replay (or an earlier poke).
            if poke.global_position <= last_global {
                continue;
            }
            last_global = poke.global_position;
            yield Ok(poke_event(&poke.stream_name, poke.position, poke.global_position));
        }
    }
}

fn poke_event(stream: &str, position: i64, global_position: i64) -> Event {
    Event::default()
        .event("poke")
        .json_data(json!({
            "stream": stream,
            "position": position,
            "globalPosition": global_position,
        }))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> SubscribeQuery {
        let mut query = SubscribeQuery::default();
        for (key, value) in pairs {
            let value = value.to_string();
            match *key {
                "stream" => query.stream = Some(value),
                "category" => query.category = Some(value),
                "position" => query.position = Some(value),
                "correlation" => query.correlation = Some(value),
                "consumerGroupMember" => query.consumer_group_member = Some(value),
                "consumerGroupSize" => query.consumer_group_size = Some(value),
                other => panic!("unknown key {other}"),
            }
        }
        query
    }

    #[test]
    fn resolves_stream_target() {
        let target = resolve_target(&query(&[("stream", "order-1"), ("position", "3")])).unwrap();
        assert_eq!(
            target,
            Target::Stream {
                name: "order-1".to_string(),
                position: 3
            }
        );
    }

    #[test]
    fn resolves_category_target_with_group() {
        let target = resolve_target(&query(&[
            ("category", "order"),
            ("consumerGroupMember", "1"),
            ("consumerGroupSize", "3"),
        ]))
        .unwrap();
        assert_eq!(
            target,
            Target::Category {
                name: "order".to_string(),
                position: 1,
                correlation: None,
                group: Some(ConsumerGroup { member: 1, size: 3 }),
            }
        );
    }

    #[test]
    fn requires_exactly_one_target() {
        assert!(resolve_target(&query(&[])).is_err());
        assert!(resolve_target(&query(&[
            ("stream", "order-1"),
            ("category", "order")
        ]))
        .is_err());
    }

    #[test]
    fn stream_targets_reject_category_filters() {
        assert!(resolve_target(&query(&[
            ("stream", "order-1"),
            ("correlation", "checkout")
        ]))
        .is_err());
        assert!(resolve_target(&query(&[
            ("stream", "order-1"),
            ("consumerGroupMember", "0"),
            ("consumerGroupSize", "2")
        ]))
        .is_err());
    }

    #[test]
    fn consumer_group_needs_both_fields_and_valid_range() {
        for pairs in [
            vec![("category", "order"), ("consumerGroupMember", "0")],
            vec![("category", "order"), ("consumerGroupSize", "3")],
            vec![
                ("category", "order"),
                ("consumerGroupMember", "3"),
                ("consumerGroupSize", "3"),
            ],
            vec![
                ("category", "order"),
                ("consumerGroupMember", "-1"),
                ("consumerGroupSize", "3"),
            ],
        ] {
            assert!(resolve_target(&query(&pairs)).is_err(), "{pairs:?}");
        }
    }

    #[test]
    fn category_target_rejects_entity_names_and_bad_numbers() {
        assert!(resolve_target(&query(&[("category", "order-1")])).is_err());
        assert!(resolve_target(&query(&[
            ("category", "order"),
            ("position", "abc")
        ]))
        .is_err());
        assert!(resolve_target(&query(&[("stream", "s-1"), ("position", "-2")])).is_err());
    }

    #[test]
    fn category_position_floor_is_one() {
        let target = resolve_target(&query(&[("category", "order"), ("position", "0")])).unwrap();
        assert!(matches!(target, Target::Category { position: 1, .. }));
    }
}
