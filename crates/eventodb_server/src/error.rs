//! Wire-level errors. Every failure a client can see maps to exactly one
//! error code and one HTTP status, with an envelope of the form
//! `{"error": {"code", "message", "details?"}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    MethodNotFound,
    AuthRequired,
    AuthInvalidToken,
    AuthUnauthorized,
    NamespaceNotFound,
    NamespaceExists,
    StreamVersionConflict,
    BackendError,
    NotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            ErrorCode::AuthUnauthorized => "AUTH_UNAUTHORIZED",
            ErrorCode::NamespaceNotFound => "NAMESPACE_NOT_FOUND",
            ErrorCode::NamespaceExists => "NAMESPACE_EXISTS",
            ErrorCode::StreamVersionConflict => "STREAM_VERSION_CONFLICT",
            ErrorCode::BackendError => "BACKEND_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::MethodNotFound => StatusCode::NOT_FOUND,
            ErrorCode::AuthRequired => StatusCode::UNAUTHORIZED,
            ErrorCode::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            ErrorCode::AuthUnauthorized => StatusCode::FORBIDDEN,
            ErrorCode::NamespaceNotFound => StatusCode::NOT_FOUND,
            ErrorCode::NamespaceExists => StatusCode::CONFLICT,
            ErrorCode::StreamVersionConflict => StatusCode::CONFLICT,
            ErrorCode::BackendError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("unknown method: {method}"))
    }

    pub fn auth_required() -> Self {
        Self::new(ErrorCode::AuthRequired, "authentication required")
    }

    pub fn invalid_token() -> Self {
        Self::new(ErrorCode::AuthInvalidToken, "invalid token")
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthUnauthorized, message)
    }
}

impl From<eventodb::Error> for RpcError {
    fn from(err: eventodb::Error) -> Self {
        use eventodb::Error;

        match err {
            Error::WrongExpectedVersion {
                expected, actual, ..
            } => RpcError {
                code: ErrorCode::StreamVersionConflict,
                message: err.to_string(),
                details: Some(json!({ "expected": expected, "actual": actual })),
            },
            Error::NamespaceNotFound(_) => Self::new(ErrorCode::NamespaceNotFound, err.to_string()),
            Error::NamespaceExists(_) => Self::new(ErrorCode::NamespaceExists, err.to_string()),
            Error::InvalidNamespaceId(_)
            | Error::InvalidMessageId(_)
            | Error::EmptyStreamName(_) => Self::invalid_request(err.to_string()),
            // Operator-oriented summary; internals stay in the logs.
            Error::Backend(_) => Self::new(ErrorCode::BackendError, err.to_string()),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code.as_str(),
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }

        (self.code.status(), Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_carries_observed_version() {
        let err = RpcError::from(eventodb::Error::WrongExpectedVersion {
            stream_name: "account-1".to_string(),
            expected: 5,
            actual: 0,
        });
        assert_eq!(err.code, ErrorCode::StreamVersionConflict);
        assert_eq!(err.code.status(), StatusCode::CONFLICT);
        let details = err.details.unwrap();
        assert_eq!(details["expected"], 5);
        assert_eq!(details["actual"], 0);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorCode::InvalidRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::MethodNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::AuthRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::AuthUnauthorized.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::NamespaceExists.status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::BackendError.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
