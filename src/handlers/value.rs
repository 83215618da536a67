//! Series read handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use tracing::instrument;

use super::{is_json, ApiError};
use crate::metric::{MetricError, MetricKind, Metrics};
use crate::state::SharedState;

/// Handler for `GET /value/{type}/{name}`.
///
/// An unknown type reads as an absent series.
#[instrument(skip(state))]
pub async fn value_path_handler(
    State(state): State<SharedState>,
    Path((mtype, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind: MetricKind = mtype
        .parse()
        .map_err(|e: MetricError| state.reject(ApiError::NotFound(e.to_string())))?;

    let value = state
        .storage
        .get_value(kind, &name)
        .await
        .map_err(|e| state.reject(e.into()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], value))
}

/// Handler for `POST /value` with a `{id, type}` JSON query.
///
/// Everything except undecodable JSON answers 404.
#[instrument(skip_all)]
pub async fn value_json_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Metrics>, ApiError> {
    if !is_json(&headers) {
        return Err(state.reject(ApiError::NotFound(
            "content type must be application/json".into(),
        )));
    }
    let query: Metrics = serde_json::from_slice(&body)
        .map_err(|e| state.reject(ApiError::BadRequest(format!("invalid JSON: {e}"))))?;
    if query.id.is_empty() {
        return Err(state.reject(ApiError::NotFound("id missing".into())));
    }
    let kind: MetricKind = query
        .mtype
        .parse()
        .map_err(|e: MetricError| state.reject(ApiError::NotFound(e.to_string())))?;

    let metric = state
        .storage
        .get_metric(kind, &query.id)
        .await
        .map_err(|e| state.reject(e.into()))?;
    Ok(Json(metric))
}
