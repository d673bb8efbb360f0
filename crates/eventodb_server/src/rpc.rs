//! The RPC dispatcher. One endpoint, `POST /rpc`, takes a JSON array
//! `[method, arg1, arg2, ...]` and answers with the raw JSON result or an
//! error envelope. Arguments are positional; trailing options are objects of
//! named values.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use eventodb::store::WriteMessageOpts;
use eventodb::stream_name::{Category, StreamName};
use eventodb::{GetCategoryMessagesOpts, GetStreamMessagesOpts, Message};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::app::AppState;
use crate::auth::{generate_token, hash_token, token_namespace, AuthContext, TOKEN_HEADER};
use crate::error::{ErrorCode, RpcError};
use crate::pubsub::Poke;

/// Hard ceiling for bounded reads; `-1` selects the unlimited path.
const MAX_BATCH_SIZE: i64 = 10_000;

pub async fn handle_rpc(
    State(state): State<AppState>,
    auth: AuthContext,
    body: Bytes,
) -> Response {
    let announce = auth.announce_token.clone();

    let mut response = match dispatch(&state, &auth, &body).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => err.into_response(),
    };

    if let Some(token) = announce {
        if let Ok(value) = HeaderValue::from_str(&token) {
            response.headers_mut().insert(TOKEN_HEADER, value);
        }
    }

    response
}

pub async fn dispatch(
    state: &AppState,
    auth: &AuthContext,
    body: &[u8],
) -> Result<Value, RpcError> {
    let envelope: Value = serde_json::from_slice(body)
        .map_err(|err| RpcError::invalid_request(format!("invalid JSON: {err}")))?;
    let elements = envelope
        .as_array()
        .filter(|elements| !elements.is_empty())
        .ok_or_else(|| RpcError::invalid_request("request must be a non-empty array"))?;
    let method = elements[0]
        .as_str()
        .ok_or_else(|| RpcError::invalid_request("method must be a string"))?;
    let args = &elements[1..];

    debug!(method, namespace = %auth.namespace, "rpc");

    match tokio::time::timeout(state.request_timeout, route(state, auth, method, args)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::new(
            ErrorCode::BackendError,
            "request deadline exceeded",
        )),
    }
}

async fn route(
    state: &AppState,
    auth: &AuthContext,
    method: &str,
    args: &[Value],
) -> Result<Value, RpcError> {
    match method {
        "stream.write" => stream_write(state, auth, args).await,
        "stream.get" => stream_get(state, auth, args).await,
        "stream.last" => stream_last(state, auth, args).await,
        "stream.version" => stream_version(state, auth, args).await,
        "category.get" => category_get(state, auth, args).await,
        "ns.create" => ns_create(state, auth, args).await,
        "ns.delete" => ns_delete(state, auth, args).await,
        "ns.list" => ns_list(state, auth).await,
        "ns.info" => ns_info(state, auth, args).await,
        "sys.version" => Ok(json!(env!("CARGO_PKG_VERSION"))),
        "sys.health" => sys_health(state).await,
        other => Err(RpcError::method_not_found(other)),
    }
}

async fn stream_write(
    state: &AppState,
    auth: &AuthContext,
    args: &[Value],
) -> Result<Value, RpcError> {
    let stream = required_str(args, 0, "stream")?;
    let stream_name = StreamName::new(stream)
        .map_err(|err| RpcError::invalid_request(err.to_string()))?;

    let Some(Value::Object(message)) = args.get(1) else {
        return Err(RpcError::invalid_request("message must be an object"));
    };
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .filter(|msg_type| !msg_type.is_empty())
        .ok_or_else(|| RpcError::invalid_request("message type must be a non-empty string"))?;
    let data = match message.get("data") {
        Some(data @ Value::Object(_)) => data,
        Some(_) => return Err(RpcError::invalid_request("message data must be an object")),
        None => return Err(RpcError::invalid_request("message data is required")),
    };
    let metadata = match message.get("metadata") {
        None | Some(Value::Null) => None,
        Some(metadata @ Value::Object(_)) => Some(metadata),
        Some(_) => return Err(RpcError::invalid_request("message metadata must be an object")),
    };

    let options = options_arg(args, 2)?;
    let id = parse_message_id(options.and_then(|o| o.get("id")).or_else(|| message.get("id")))?;
    let expected_version = opt_i64(options, "expectedVersion")?;
    if expected_version.is_some_and(|version| version < -1) {
        return Err(RpcError::invalid_request(
            "expectedVersion must be -1 or greater",
        ));
    }

    let written = state
        .store
        .write_message(
            &auth.namespace,
            &stream_name,
            msg_type,
            data,
            &WriteMessageOpts {
                id,
                metadata,
                expected_version,
            },
        )
        .await?;

    state.hub.publish(&Poke {
        namespace: auth.namespace.clone(),
        stream_name: stream_name.to_string(),
        position: written.position,
        global_position: written.global_position,
        time: written.time,
    });

    Ok(json!({
        "position": written.position,
        "globalPosition": written.global_position,
    }))
}

async fn stream_get(
    state: &AppState,
    auth: &AuthContext,
    args: &[Value],
) -> Result<Value, RpcError> {
    let stream = required_str(args, 0, "stream")?;
    let stream_name = StreamName::new(stream)
        .map_err(|err| RpcError::invalid_request(err.to_string()))?;

    let options = options_arg(args, 1)?;
    let position = opt_i64(options, "position")?;
    if position.is_some_and(|p| p < 0) {
        return Err(RpcError::invalid_request("position must be 0 or greater"));
    }
    let global_position = opt_i64(options, "globalPosition")?;
    if global_position.is_some_and(|p| p < 0) {
        return Err(RpcError::invalid_request(
            "globalPosition must be 0 or greater",
        ));
    }
    let batch_size = batch_size_opt(options)?;
    let _ = opt_str(options, "condition")?; // accepted, never honored

    let messages = state
        .store
        .get_stream_messages(
            &auth.namespace,
            &stream_name,
            &GetStreamMessagesOpts {
                position,
                global_position,
                batch_size,
            },
        )
        .await?;

    Ok(Value::Array(messages.iter().map(stream_tuple).collect()))
}

async fn stream_last(
    state: &AppState,
    auth: &AuthContext,
    args: &[Value],
) -> Result<Value, RpcError> {
    let stream = required_str(args, 0, "stream")?;
    let stream_name = StreamName::new(stream)
        .map_err(|err| RpcError::invalid_request(err.to_string()))?;
    let options = options_arg(args, 1)?;
    let msg_type = opt_str(options, "type")?;

    let message = state
        .store
        .get_last_stream_message(&auth.namespace, &stream_name, msg_type)
        .await?;

    Ok(message.as_ref().map(stream_tuple).unwrap_or(Value::Null))
}

async fn stream_version(
    state: &AppState,
    auth: &AuthContext,
    args: &[Value],
) -> Result<Value, RpcError> {
    let stream = required_str(args, 0, "stream")?;
    let stream_name = StreamName::new(stream)
        .map_err(|err| RpcError::invalid_request(err.to_string()))?;

    let version = state
        .store
        .stream_version(&auth.namespace, &stream_name)
        .await?;

    Ok(version.map(Value::from).unwrap_or(Value::Null))
}

async fn category_get(
    state: &AppState,
    auth: &AuthContext,
    args: &[Value],
) -> Result<Value, RpcError> {
    let name = required_str(args, 0, "category")?;
    if name.contains(StreamName::ID_SEPARATOR) {
        return Err(RpcError::invalid_request(
            "category must not contain a stream id",
        ));
    }
    let category = Category::new(name)
        .map_err(|err| RpcError::invalid_request(err.to_string()))?;

    let options = options_arg(args, 1)?;
    let position = opt_i64(options, "position")?;
    if position.is_some_and(|p| p < 1) {
        return Err(RpcError::invalid_request("position must be 1 or greater"));
    }
    let global_position = opt_i64(options, "globalPosition")?;
    if global_position.is_some_and(|p| p < 1) {
        return Err(RpcError::invalid_request(
            "globalPosition must be 1 or greater",
        ));
    }
    let batch_size = batch_size_opt(options)?;
    let correlation = opt_str(options, "correlation")?;
    if correlation.is_some_and(str::is_empty) {
        return Err(RpcError::invalid_request(
            "correlation must be a non-empty string",
        ));
    }
    let group = consumer_group_opt(options)?;
    let _ = opt_str(options, "condition")?; // accepted, never honored

    let messages = state
        .store
        .get_category_messages(
            &auth.namespace,
            &category,
            &GetCategoryMessagesOpts {
                position: global_position.or(position),
                batch_size,
                correlation,
                consumer_group_member: group.map(|(member, _)| member),
                consumer_group_size: group.map(|(_, size)| size),
            },
        )
        .await?;

    Ok(Value::Array(messages.iter().map(category_tuple).collect()))
}

async fn ns_create(
    state: &AppState,
    auth: &AuthContext,
    args: &[Value],
) -> Result<Value, RpcError> {
    auth.require_admin()?;

    let id = required_str(args, 0, "namespace id")?;
    let options = options_arg(args, 1)?;
    let description = opt_str(options, "description")?;

    let token = match opt_str(options, "token")? {
        Some(token) => {
            let embedded = token_namespace(token).ok_or_else(|| {
                RpcError::invalid_request("token must have the form ns_<namespace>_<secret>")
            })?;
            if embedded != id {
                return Err(RpcError::invalid_request(
                    "token does not embed this namespace id",
                ));
            }
            token.to_string()
        }
        None => generate_token(id),
    };

    let record = state
        .store
        .create_namespace(id, &hash_token(&token), description)
        .await?;

    Ok(json!({
        "namespace": record.id,
        "token": token,
        "createdAt": format_time(record.created_at),
    }))
}

async fn ns_delete(
    state: &AppState,
    auth: &AuthContext,
    args: &[Value],
) -> Result<Value, RpcError> {
    auth.require_admin()?;

    let id = required_str(args, 0, "namespace id")?;
    let deleted = state.store.delete_namespace(id).await?;

    Ok(json!({
        "namespace": id,
        "deletedAt": format_time(Utc::now()),
        "messagesDeleted": deleted,
    }))
}

async fn ns_list(state: &AppState, auth: &AuthContext) -> Result<Value, RpcError> {
    auth.require_admin()?;

    let namespaces = state.store.list_namespaces().await?;
    let summaries = namespaces
        .into_iter()
        .map(|ns| {
            json!({
                "namespace": ns.id,
                "description": ns.description,
                "createdAt": format_time(ns.created_at),
            })
        })
        .collect();

    Ok(Value::Array(summaries))
}

async fn ns_info(
    state: &AppState,
    auth: &AuthContext,
    args: &[Value],
) -> Result<Value, RpcError> {
    let id = required_str(args, 0, "namespace id")?;
    if id != auth.namespace {
        auth.require_admin()?;
    }

    let record = state.store.get_namespace(id).await?;
    let stats = state.store.namespace_stats(id).await?;

    Ok(json!({
        "namespace": record.id,
        "description": record.description,
        "createdAt": format_time(record.created_at),
        "messageCount": stats.message_count,
        "lastGlobalPosition": stats.last_global_position,
    }))
}

async fn sys_health(state: &AppState) -> Result<Value, RpcError> {
    let health = state.store.health().await?;

    Ok(json!({
        "status": "ok",
        "backend": health.backend,
        "connections": health.connections,
    }))
}

/// `[id, type, position, globalPosition, data, metadata, time]`
fn stream_tuple(message: &Message<'_>) -> Value {
    json!([
        message.id,
        message.msg_type,
        message.position,
        message.global_position,
        message.data,
        message.metadata,
        format_time(message.time),
    ])
}

/// `[id, stream, type, position, globalPosition, data, metadata, time]`
fn category_tuple(message: &Message<'_>) -> Value {
    json!([
        message.id,
        message.stream_name,
        message.msg_type,
        message.position,
        message.global_position,
        message.data,
        message.metadata,
        format_time(message.time),
    ])
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn required_str<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str, RpcError> {
    match args.get(index) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value),
        _ => Err(RpcError::invalid_request(format!(
            "{name} must be a non-empty string"
        ))),
    }
}

fn options_arg<'a>(
    args: &'a [Value],
    index: usize,
) -> Result<Option<&'a Map<String, Value>>, RpcError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(RpcError::invalid_request("options must be an object")),
    }
}

fn opt_i64(options: Option<&Map<String, Value>>, key: &str) -> Result<Option<i64>, RpcError> {
    match options.and_then(|options| options.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| RpcError::invalid_request(format!("{key} must be an integer"))),
    }
}

fn opt_str<'a>(
    options: Option<&'a Map<String, Value>>,
    key: &str,
) -> Result<Option<&'a str>, RpcError> {
    match options.and_then(|options| options.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(RpcError::invalid_request(format!("{key} must be a string"))),
    }
}

fn batch_size_opt(options: Option<&Map<String, Value>>) -> Result<Option<i64>, RpcError> {
    let batch_size = opt_i64(options, "batchSize")?;
    if batch_size.is_some_and(|batch_size| batch_size > MAX_BATCH_SIZE) {
        return Err(RpcError::invalid_request(
            "batchSize must be at most 10000 (-1 for unlimited)",
        ));
    }

    Ok(batch_size)
}

fn consumer_group_opt(
    options: Option<&Map<String, Value>>,
) -> Result<Option<(i64, i64)>, RpcError> {
    let group = match options.and_then(|options| options.get("consumerGroup")) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(group)) => group,
        Some(_) => {
            return Err(RpcError::invalid_request("consumerGroup must be an object"))
        }
    };

    let member = group.get("member").and_then(Value::as_i64);
    let size = group.get("size").and_then(Value::as_i64);
    match (member, size) {
        (Some(member), Some(size)) if size >= 1 && (0..size).contains(&member) => {
            Ok(Some((member, size)))
        }
        _ => Err(RpcError::invalid_request(
            "consumerGroup requires integer member and size with 0 <= member < size",
        )),
    }
}

fn parse_message_id(value: Option<&Value>) -> Result<Option<Uuid>, RpcError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Uuid::parse_str(id)
            .map(Some)
            .map_err(|_| RpcError::invalid_request("id must be a valid UUID")),
        Some(_) => Err(RpcError::invalid_request("id must be a UUID string")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use eventodb::Store;
    use eventodb_memory::MemoryStore;

    use super::*;
    use crate::pubsub::Hub;

    async fn test_state() -> AppState {
        let store = MemoryStore::new();
        store
            .create_namespace("default", &hash_token("unused"), None)
            .await
            .unwrap();

        AppState {
            store: Arc::new(store),
            hub: Hub::new(),
            test_mode: true,
            default_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    fn admin() -> AuthContext {
        AuthContext {
            namespace: "default".to_string(),
            announce_token: None,
        }
    }

    async fn call(state: &AppState, auth: &AuthContext, envelope: Value) -> Result<Value, RpcError> {
        dispatch(state, auth, envelope.to_string().as_bytes()).await
    }

    #[tokio::test]
    async fn rejects_malformed_envelopes() {
        let state = test_state().await;
        let auth = admin();

        for body in [
            json!({"method": "stream.get"}),
            json!([]),
            json!([42, "x"]),
        ] {
            let err = call(&state, &auth, body).await.unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidRequest);
        }

        let err = dispatch(&state, &auth, b"not json").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let state = test_state().await;
        let err = call(&state, &admin(), json!(["stream.rename", "a-1"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MethodNotFound);
    }

    #[tokio::test]
    async fn write_then_read_sequential_versions() {
        let state = test_state().await;
        let auth = admin();

        for _ in 0..3 {
            let result = call(
                &state,
                &auth,
                json!(["stream.write", "account-1", {"type": "A", "data": {}}]),
            )
            .await
            .unwrap();
            assert!(result["globalPosition"].as_i64().unwrap() >= 1);
        }

        let version = call(&state, &auth, json!(["stream.version", "account-1"]))
            .await
            .unwrap();
        assert_eq!(version, json!(2));

        let rows = call(
            &state,
            &auth,
            json!(["stream.get", "account-1", {"batchSize": 10}]),
        )
        .await
        .unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        let positions: Vec<i64> = rows.iter().map(|row| row[2].as_i64().unwrap()).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        // [id, type, position, globalPosition, data, metadata, time]
        assert_eq!(rows[0][1], "A");
        assert!(rows[0][6].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn version_conflict_maps_to_conflict_envelope() {
        let state = test_state().await;
        let auth = admin();

        call(
            &state,
            &auth,
            json!(["stream.write", "account-2", {"type": "B", "data": {}}]),
        )
        .await
        .unwrap();

        let err = call(
            &state,
            &auth,
            json!([
                "stream.write",
                "account-2",
                {"type": "B", "data": {}},
                {"expectedVersion": 5}
            ]),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::StreamVersionConflict);
        assert_eq!(err.details.unwrap()["actual"], 0);

        let version = call(&state, &auth, json!(["stream.version", "account-2"]))
            .await
            .unwrap();
        assert_eq!(version, json!(0));
    }

    #[tokio::test]
    async fn missing_stream_version_is_null() {
        let state = test_state().await;
        let version = call(&state, &admin(), json!(["stream.version", "ghost-1"]))
            .await
            .unwrap();
        assert_eq!(version, Value::Null);
    }

    #[tokio::test]
    async fn category_get_returns_stream_field() {
        let state = test_state().await;
        let auth = admin();

        for stream in ["order-1", "order-2", "order-3"] {
            call(
                &state,
                &auth,
                json!(["stream.write", stream, {"type": "Placed", "data": {}}]),
            )
            .await
            .unwrap();
        }

        let rows = call(
            &state,
            &auth,
            json!(["category.get", "order", {"batchSize": 10}]),
        )
        .await
        .unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        // [id, stream, type, position, globalPosition, ...] in global order
        let globals: Vec<i64> = rows.iter().map(|row| row[4].as_i64().unwrap()).collect();
        assert!(globals.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(rows[0][1], "order-1");
    }

    #[tokio::test]
    async fn category_name_with_id_is_rejected() {
        let state = test_state().await;
        let err = call(&state, &admin(), json!(["category.get", "order-1"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn batch_size_ceiling() {
        let state = test_state().await;
        let auth = admin();

        let err = call(
            &state,
            &auth,
            json!(["stream.get", "a-1", {"batchSize": 10001}]),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        // -1 is the unlimited sentinel and passes.
        call(&state, &auth, json!(["stream.get", "a-1", {"batchSize": -1}]))
            .await
            .unwrap();

        // Other negative values are not rejected; they resolve to an empty
        // batch at the store layer.
        let rows = call(&state, &auth, json!(["stream.get", "a-1", {"batchSize": -5}]))
            .await
            .unwrap();
        assert_eq!(rows, json!([]));
    }

    #[tokio::test]
    async fn consumer_group_validation() {
        let state = test_state().await;
        let auth = admin();

        for group in [
            json!({"member": 3, "size": 3}),
            json!({"member": -1, "size": 3}),
            json!({"member": 0}),
            json!({"size": 3}),
            json!({"member": 0, "size": 0}),
        ] {
            let err = call(
                &state,
                &auth,
                json!(["category.get", "order", {"consumerGroup": group}]),
            )
            .await
            .unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidRequest, "{group}");
        }

        call(
            &state,
            &auth,
            json!(["category.get", "order", {"consumerGroup": {"member": 0, "size": 3}}]),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn condition_is_accepted_and_ignored() {
        let state = test_state().await;
        let auth = admin();

        call(
            &state,
            &auth,
            json!(["stream.write", "order-1", {"type": "A", "data": {}}]),
        )
        .await
        .unwrap();

        let rows = call(
            &state,
            &auth,
            json!(["stream.get", "order-1", {"condition": "1 = 0"}]),
        )
        .await
        .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_last_with_type() {
        let state = test_state().await;
        let auth = admin();

        for msg_type in ["Opened", "Deposited", "Opened"] {
            call(
                &state,
                &auth,
                json!(["stream.write", "acct-9", {"type": msg_type, "data": {}}]),
            )
            .await
            .unwrap();
        }

        let last = call(
            &state,
            &auth,
            json!(["stream.last", "acct-9", {"type": "Deposited"}]),
        )
        .await
        .unwrap();
        assert_eq!(last[2], 1);

        let none = call(&state, &auth, json!(["stream.last", "ghost-1"]))
            .await
            .unwrap();
        assert_eq!(none, Value::Null);
    }

    #[tokio::test]
    async fn namespace_administration_requires_default() {
        let state = test_state().await;
        let tenant = AuthContext {
            namespace: "tenant".to_string(),
            announce_token: None,
        };

        for envelope in [
            json!(["ns.create", "other"]),
            json!(["ns.delete", "other"]),
            json!(["ns.list"]),
            json!(["ns.info", "other"]),
        ] {
            let err = call(&state, &tenant, envelope).await.unwrap_err();
            assert_eq!(err.code, ErrorCode::AuthUnauthorized);
        }
    }

    #[tokio::test]
    async fn namespace_lifecycle_via_rpc() {
        let state = test_state().await;
        let auth = admin();

        let created = call(
            &state,
            &auth,
            json!(["ns.create", "tenant", {"description": "a tenant"}]),
        )
        .await
        .unwrap();
        assert_eq!(created["namespace"], "tenant");
        let token = created["token"].as_str().unwrap();
        assert_eq!(token_namespace(token).as_deref(), Some("tenant"));

        let err = call(&state, &auth, json!(["ns.create", "tenant"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NamespaceExists);

        let info = call(&state, &auth, json!(["ns.info", "tenant"]))
            .await
            .unwrap();
        assert_eq!(info["messageCount"], 0);
        assert_eq!(info["lastGlobalPosition"], Value::Null);

        let listed = call(&state, &auth, json!(["ns.list"])).await.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 2);
        assert!(listed
            .as_array()
            .unwrap()
            .iter()
            .all(|ns| ns.get("token").is_none()));

        let deleted = call(&state, &auth, json!(["ns.delete", "tenant"]))
            .await
            .unwrap();
        assert_eq!(deleted["messagesDeleted"], 0);

        let err = call(&state, &auth, json!(["ns.info", "tenant"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NamespaceNotFound);
    }

    #[tokio::test]
    async fn write_publishes_a_poke() {
        let state = test_state().await;
        let auth = admin();
        let mut subscription = state.hub.subscribe_stream("default", "s-1");

        call(
            &state,
            &auth,
            json!(["stream.write", "s-1", {"type": "X", "data": {}}]),
        )
        .await
        .unwrap();

        let poke = subscription.receiver.recv().await.unwrap();
        assert_eq!(poke.stream_name, "s-1");
        assert_eq!(poke.position, 0);
    }

    #[tokio::test]
    async fn sys_methods() {
        let state = test_state().await;
        let auth = admin();

        let version = call(&state, &auth, json!(["sys.version"])).await.unwrap();
        assert_eq!(version, json!(env!("CARGO_PKG_VERSION")));

        let health = call(&state, &auth, json!(["sys.health"])).await.unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["backend"], "memory");
    }
}
