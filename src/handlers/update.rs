//! Ingestion endpoint handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use tracing::{debug, instrument};

use super::{is_json, ApiError};
use crate::metric::{MetricError, MetricKind, Metrics};
use crate::state::SharedState;

fn parse_body<T: serde::de::DeserializeOwned>(
    state: &SharedState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, ApiError> {
    if !is_json(headers) {
        return Err(state.reject(ApiError::BadRequest(
            "content type must be application/json".into(),
        )));
    }
    serde_json::from_slice(body)
        .map_err(|e| state.reject(ApiError::BadRequest(format!("invalid JSON: {e}"))))
}

/// Handler for `POST /update/{type}/{name}/{value}`.
#[instrument(skip(state))]
pub async fn update_path_handler(
    State(state): State<SharedState>,
    Path((mtype, name, value)): Path<(String, String, String)>,
) -> Result<(), ApiError> {
    let kind: MetricKind = mtype
        .parse()
        .map_err(|e: MetricError| state.reject(ApiError::BadRequest(e.to_string())))?;

    state
        .storage
        .set_value(kind, &name, &value)
        .await
        .map_err(|e| state.reject(e.into()))?;

    state.metrics.record_ingested(kind);
    debug!(%kind, %name, %value, "Series updated");
    Ok(())
}

/// Handler for `POST /update` with a single JSON metric.
///
/// Responds with the series value after the merge.
#[instrument(skip_all)]
pub async fn update_json_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Metrics>, ApiError> {
    let metric: Metrics = parse_body(&state, &headers, &body)?;
    let kind = metric
        .typed_value()
        .map_err(|e| state.reject(e.into()))?
        .kind();

    state
        .storage
        .set_metric(&metric)
        .await
        .map_err(|e| state.reject(e.into()))?;
    state.metrics.record_ingested(kind);

    let current = state
        .storage
        .get_metric(kind, &metric.id)
        .await
        .map_err(|e| state.reject(e.into()))?;
    debug!(id = %metric.id, %kind, "Series updated");
    Ok(Json(current))
}

/// Handler for `POST /updates` with a JSON array.
///
/// Items are applied in order; the first invalid item fails the request and
/// earlier items stay applied.
#[instrument(skip_all)]
pub async fn updates_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Vec<Metrics>>, ApiError> {
    let batch: Vec<Metrics> = parse_body(&state, &headers, &body)?;
    state
        .storage
        .set_metrics(&batch)
        .await
        .map_err(|e| state.reject(e.into()))?;

    for metric in &batch {
        if let Ok(kind) = metric.mtype.parse::<MetricKind>() {
            state.metrics.record_ingested(kind);
        }
    }
    debug!(count = batch.len(), "Batch applied");
    Ok(Json(batch))
}
