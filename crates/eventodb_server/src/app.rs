//! Shared server state, HTTP routing, and startup bootstrap.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::{get, post};
use axum::{Json, Router};
use eventodb::namespace::DEFAULT_NAMESPACE;
use eventodb::Store;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::{generate_token, hash_token};
use crate::error::{ErrorCode, RpcError};
use crate::pubsub::Hub;
use crate::{rpc, subscribe};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub hub: Hub,
    pub test_mode: bool,
    /// Raw default-namespace token, when this process knows it (it issued or
    /// was handed it). Echoed to tokenless test-mode callers.
    pub default_token: Option<Arc<str>>,
    pub request_timeout: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(rpc::handle_rpc))
        .route("/subscribe", get(subscribe::handle_subscribe))
        .route("/health", get(health))
        .route("/version", get(version))
        .fallback(not_found)
        .with_state(state)
}

// Unmatched paths get the same error envelope as everything else.
async fn not_found() -> RpcError {
    RpcError::new(ErrorCode::NotFound, "no such endpoint")
}

// Liveness only; backend reachability is sys.health's job.
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

/// Ensures the default namespace exists, minting its token when the
/// operator did not supply one. The raw token is printed exactly once, here,
/// at issuance.
pub async fn bootstrap_default_namespace(
    store: &dyn Store,
    configured_token: Option<String>,
) -> anyhow::Result<Option<String>> {
    match store.get_namespace(DEFAULT_NAMESPACE).await {
        Ok(_) => Ok(configured_token),
        Err(eventodb::Error::NamespaceNotFound(_)) => {
            let token = configured_token.unwrap_or_else(|| generate_token(DEFAULT_NAMESPACE));
            store
                .create_namespace(DEFAULT_NAMESPACE, &hash_token(&token), None)
                .await
                .context("failed to create the default namespace")?;
            info!(%token, "default namespace created; store this token, it is not shown again");
            Ok(Some(token))
        }
        Err(err) => Err(anyhow::Error::new(err).context("failed to read the namespace registry")),
    }
}

#[cfg(test)]
mod tests {
    use eventodb_memory::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn bootstrap_creates_default_once() {
        let store = MemoryStore::new();

        let token = bootstrap_default_namespace(&store, None).await.unwrap();
        let token = token.expect("token issued on first bootstrap");
        assert!(token.starts_with("ns_"));

        let record = store.get_namespace(DEFAULT_NAMESPACE).await.unwrap();
        assert_eq!(record.token_hash, hash_token(&token));

        // Second bootstrap leaves the namespace alone.
        let again = bootstrap_default_namespace(&store, Some(token.clone()))
            .await
            .unwrap();
        assert_eq!(again, Some(token));
    }

    #[tokio::test]
    async fn bootstrap_uses_configured_token() {
        let store = MemoryStore::new();
        let token = generate_token(DEFAULT_NAMESPACE);

        bootstrap_default_namespace(&store, Some(token.clone()))
            .await
            .unwrap();

        let record = store.get_namespace(DEFAULT_NAMESPACE).await.unwrap();
        assert_eq!(record.token_hash, hash_token(&token));
    }
}
