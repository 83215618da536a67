//! Ingestion middleware chain.
//!
//! Outermost first: access log, trusted subnet, signature, decryption,
//! decompression. Every filter is a no-op when its setting is absent.

use std::net::IpAddr;
use std::time::Instant;

use axum::body::{to_bytes, Body, Bytes, HttpBody};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use crate::agent::poster::REAL_IP_HEADER;
use crate::codec::{self, SIGNATURE_HEADER};
use crate::handlers::ApiError;
use crate::state::SharedState;

/// Upper bound on request and response bodies buffered by the chain.
const MAX_BODY: usize = 32 * 1024 * 1024;

/// Logs method, path, status, response size and latency of every request.
pub async fn access_log(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let size = response.body().size_hint().exact().unwrap_or_default();
    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        size,
        latency_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Request served"
    );
    response
}

/// Rejects requests whose `X-Real-IP` is missing or outside the trusted subnet.
pub async fn trusted_subnet(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(subnet) = state.trusted_subnet else {
        return next.run(request).await;
    };

    let ip = request
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    match ip {
        Some(ip) if subnet.contains(&ip) => next.run(request).await,
        other => {
            warn!(ip = ?other, %subnet, "Request from untrusted address");
            state
                .reject(ApiError::Forbidden("address not trusted".into()))
                .into_response()
        }
    }
}

async fn buffer(body: Body) -> Result<Bytes, ApiError> {
    to_bytes(body, MAX_BODY)
        .await
        .map_err(|e| ApiError::BadRequest(format!("reading body: {e}")))
}

/// Replaces the body and drops headers that described the old one.
fn rebuild(parts: axum::http::request::Parts, body: Vec<u8>) -> Request {
    let mut request = Request::from_parts(parts, Body::from(body));
    request.headers_mut().remove(header::CONTENT_LENGTH);
    request
}

/// Verifies `HashSHA256` over the raw body and signs the response.
pub async fn verify_signature(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let (Some(key), Some(signature)) = (
        state.hash_key.as_deref(),
        request
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
    ) else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let bytes = match buffer(body).await {
        Ok(b) => b,
        Err(e) => return state.reject(e).into_response(),
    };
    if let Err(e) = codec::verify(&bytes, key, &signature) {
        warn!(error = %e, "Signature check failed");
        state.metrics.record_rejected("signature");
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    sign_response(response, key).await
}

async fn sign_response(response: Response, key: &str) -> Response {
    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_BODY).await {
        Ok(b) => b,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    if let Ok(value) = HeaderValue::from_str(&codec::sign(&bytes, key)) {
        parts.headers.insert(SIGNATURE_HEADER, value);
    }
    Response::from_parts(parts, Body::from(bytes))
}

/// Decrypts an RSA-chunked body with the collector's private key.
pub async fn decrypt_body(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(key) = state.private_key.as_ref() else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let bytes = match buffer(body).await {
        Ok(b) => b,
        Err(e) => return state.reject(e).into_response(),
    };
    match codec::decrypt(key, &bytes) {
        Ok(plain) => next.run(rebuild(parts, plain)).await,
        Err(e) => {
            warn!(error = %e, "Decryption failed");
            state.metrics.record_rejected("decrypt");
            (StatusCode::INTERNAL_SERVER_ERROR, "decryption failed").into_response()
        }
    }
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case(token))
}

fn compressible(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json") || ct.starts_with("text/html"))
}

/// Gunzips `Content-Encoding: gzip` requests and gzips JSON or HTML
/// responses for clients that accept it.
pub async fn gzip(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let accepts_gzip = header_has_token(request.headers(), header::ACCEPT_ENCODING, "gzip");

    let request = if header_has_token(request.headers(), header::CONTENT_ENCODING, "gzip") {
        let (parts, body) = request.into_parts();
        let bytes = match buffer(body).await {
            Ok(b) => b,
            Err(e) => return state.reject(e).into_response(),
        };
        match codec::decompress(&bytes) {
            Ok(plain) => {
                let mut request = rebuild(parts, plain);
                request.headers_mut().remove(header::CONTENT_ENCODING);
                request
            }
            Err(e) => {
                warn!(error = %e, "Corrupt gzip body");
                state.metrics.record_rejected("gzip");
                return (StatusCode::BAD_REQUEST, "corrupt gzip body").into_response();
            }
        }
    } else {
        request
    };

    let response = next.run(request).await;
    if !accepts_gzip || !compressible(response.headers()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let packed = match to_bytes(body, MAX_BODY).await {
        Ok(bytes) => codec::compress(&bytes),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    match packed {
        Ok(packed) => {
            parts
                .headers
                .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(packed))
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
