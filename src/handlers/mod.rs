//! HTTP endpoint handlers for the collector.
//!
//! This module provides handlers for all HTTP endpoints:
//! - `/update/...`, `/update`, `/updates`: ingestion
//! - `/value/...`, `/value`: reads
//! - `/`, `/ping`: listing and health
//! - `/metrics`: collector self-telemetry

pub mod metrics;
pub mod root;
pub mod update;
pub mod value;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::metric::MetricError;
use crate::storage::StorageError;

// Re-export handlers
pub use metrics::metrics_handler;
pub use root::{ping_handler, root_handler};
pub use update::{update_json_handler, update_path_handler, updates_handler};
pub use value::{value_json_handler, value_path_handler};

/// Error type for handler failures, mapped to a status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label for the rejected-requests counter.
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (ApiError::BadRequest(msg)
        | ApiError::NotFound(msg)
        | ApiError::Forbidden(msg)
        | ApiError::Internal(msg)) = self;
        (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], msg).into_response()
    }
}

/// Ingestion mapping: a missing id or value is 404, any other invalid
/// input is 400.
impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        let msg = e.to_string();
        match e {
            StorageError::Invalid(MetricError::IdMissing | MetricError::ValueMissing(_)) => {
                ApiError::NotFound(msg)
            }
            StorageError::Invalid(_) | StorageError::Overflow(_) => ApiError::BadRequest(msg),
            StorageError::NotFound => ApiError::NotFound(msg),
            _ => ApiError::Internal(msg),
        }
    }
}

impl From<MetricError> for ApiError {
    fn from(e: MetricError) -> Self {
        StorageError::Invalid(e).into()
    }
}

/// True when the request declares a JSON body.
pub fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("application/json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;

    #[test]
    fn test_storage_error_mapping() {
        let status = |e: StorageError| ApiError::from(e).status();
        assert_eq!(
            status(StorageError::Invalid(MetricError::IdMissing)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(StorageError::Invalid(MetricError::ValueMissing("a".into()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(StorageError::Invalid(MetricError::UnknownType("x".into()))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(StorageError::Invalid(MetricError::InvalidValue {
                kind: MetricKind::Counter,
                raw: "1.5".into()
            })),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status(StorageError::Overflow("c".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(StorageError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status(StorageError::Unsupported("postgres")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_is_json_accepts_charset_suffix() {
        let mut headers = HeaderMap::new();
        assert!(!is_json(&headers));
        headers.insert(
            header::CONTENT_TYPE,
            "application/json; charset=utf-8".parse().unwrap(),
        );
        assert!(is_json(&headers));
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        assert!(!is_json(&headers));
    }
}
