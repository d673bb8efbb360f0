//! Token authentication. Tokens have the shape
//! `ns_<base64url(namespace)>_<64 hex characters>`; the embedded namespace
//! names the registry record, and the SHA-256 of the whole token must match
//! that record's stored hash. The raw token is shown once at issuance and
//! never again; only its hash is persisted.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::app::AppState;
use crate::error::RpcError;

/// Response header announcing auto-provisioned credentials in test mode.
pub const TOKEN_HEADER: &str = "X-MessageDB-Token";

const TOKEN_PREFIX: &str = "ns_";
const SECRET_HEX_LEN: usize = 64;

/// Mints a token for a namespace: 32 random bytes of secret, hex-encoded,
/// behind the namespace's base64url name.
pub fn generate_token(namespace: &str) -> String {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    format!(
        "{TOKEN_PREFIX}{}_{}",
        URL_SAFE_NO_PAD.encode(namespace),
        hex::encode(secret)
    )
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Recovers the namespace id from a token, rejecting anything that does not
/// have the `ns_<base64url>_<64 hex>` shape. The base64url alphabet includes
/// `_`, so the secret is split off the tail, not the front.
pub fn token_namespace(token: &str) -> Option<String> {
    let rest = token.strip_prefix(TOKEN_PREFIX)?;
    let (encoded, secret) = rest.rsplit_once('_')?;
    if encoded.is_empty()
        || secret.len() != SECRET_HEX_LEN
        || !secret.chars().all(|c| c.is_ascii_hexdigit())
    {
        return None;
    }

    let namespace = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(namespace).ok()
}

/// The authenticated namespace for one request.
///
/// `announce_token` is populated when test mode resolved a tokenless request
/// to the default namespace; handlers echo it back in [`TOKEN_HEADER`].
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub namespace: String,
    pub announce_token: Option<String>,
}

impl AuthContext {
    /// Namespace administration requires the default namespace's token.
    pub fn require_admin(&self) -> Result<(), RpcError> {
        if self.namespace == eventodb::namespace::DEFAULT_NAMESPACE {
            Ok(())
        } else {
            Err(RpcError::unauthorized(
                "namespace administration requires the default namespace token",
            ))
        }
    }
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = RpcError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).or_else(|| query_token(parts));

        let Some(token) = token else {
            if state.test_mode {
                return Ok(AuthContext {
                    namespace: eventodb::namespace::DEFAULT_NAMESPACE.to_string(),
                    announce_token: state.default_token.as_deref().map(str::to_string),
                });
            }
            return Err(RpcError::auth_required());
        };

        let namespace = token_namespace(&token).ok_or_else(RpcError::invalid_token)?;
        let record = state
            .store
            .get_namespace(&namespace)
            .await
            .map_err(|err| match err {
                eventodb::Error::NamespaceNotFound(_) => RpcError::invalid_token(),
                other => other.into(),
            })?;

        if hash_token(&token) != record.token_hash {
            return Err(RpcError::invalid_token());
        }

        Ok(AuthContext {
            namespace,
            announce_token: None,
        })
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts.headers.get(axum::http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

/// `?token=` support for transports that cannot set headers (SSE). Tokens
/// only contain URL-safe characters, so no percent-decoding is involved.
fn query_token(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" && !value.is_empty()).then(|| value.to_string())
    })
}
