//! Listing and health endpoint handlers.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use serde_json::{Map, Value};
use tracing::{debug, error, instrument};

use super::ApiError;
use crate::metric::MetricKind;
use crate::state::SharedState;

/// Handler for `GET /`: every series as indented JSON, grouped by kind.
#[instrument(skip(state))]
pub async fn root_handler(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let listing = state.storage.list_all().await.map_err(|e| {
        error!(error = %e, "Listing storage failed");
        state.reject(ApiError::Internal(e.to_string()))
    })?;

    let mut doc = Map::new();
    for kind in MetricKind::ALL {
        let series: Map<String, Value> = listing
            .partition(kind)
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();
        doc.insert(kind.to_string(), Value::Object(series));
    }
    let body = serde_json::to_string_pretty(&Value::Object(doc))
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    debug!(series = listing.len(), "Listing served");
    Ok(([(header::CONTENT_TYPE, "text/html; charset=utf-8")], body))
}

/// Handler for `GET /ping`: 200 when the storage backend answers.
#[instrument(skip(state))]
pub async fn ping_handler(State(state): State<SharedState>) -> impl IntoResponse {
    match state.storage.ping().await {
        Ok(()) => (StatusCode::OK, "OK".to_string()),
        Err(e) => {
            error!(backend = state.storage.name(), error = %e, "Storage ping failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
