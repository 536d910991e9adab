use super::response::json_response;
use super::RelayState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::Response;
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::Arc;
use tracing::info;
use url::form_urlencoded;

pub async fn log_requests(
    State(state): State<Arc<RelayState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.verbose {
        info!(relay = %state.name, path = %request.uri().path(), "got request");
    }
    next.run(request).await
}

/// Transparently inflates gzip encoded request bodies.
pub async fn decompress_body(request: Request, next: Next) -> Response {
    let is_gzip = request
        .headers()
        .get(header::CONTENT_ENCODING)
        .is_some_and(|encoding| encoding.as_bytes() == b"gzip");
    if !is_gzip {
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let Ok(compressed) = axum::body::to_bytes(body, usize::MAX).await else {
        return json_response(StatusCode::BAD_REQUEST, "unable to decode gzip body");
    };

    let mut decoded = Vec::new();
    let mut decoder = GzDecoder::new(&compressed[..]);
    if decoder.read_to_end(&mut decoded).is_err() {
        return json_response(StatusCode::BAD_REQUEST, "unable to decode gzip body");
    }

    parts.headers.remove(header::CONTENT_ENCODING);
    parts.headers.remove(header::CONTENT_LENGTH);

    next.run(Request::from_parts(parts, Body::from(decoded))).await
}

/// Requires `db` on the write paths, injects the default retention policy,
/// and re-encodes the query string so equal queries compare equal
/// downstream.
pub async fn normalize_query(
    State(state): State<Arc<RelayState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let mut params: Vec<(String, String)> =
        form_urlencoded::parse(request.uri().query().unwrap_or("").as_bytes())
            .into_owned()
            .collect();

    let write_path = path == "/write" || path == "/api/v1/prom/write";
    if write_path && !params.iter().any(|(key, value)| key == "db" && !value.is_empty()) {
        return json_response(StatusCode::BAD_REQUEST, "missing parameter: db");
    }

    if let Some(rp) = &state.default_retention_policy {
        if !params.iter().any(|(key, value)| key == "rp" && !value.is_empty()) {
            params.retain(|(key, _)| key != "rp");
            params.push(("rp".to_string(), rp.clone()));
        }
    }

    params.sort_by(|a, b| a.0.cmp(&b.0));
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &params {
        serializer.append_pair(key, value);
    }
    let encoded = serializer.finish();

    let path_and_query = if encoded.is_empty() {
        path
    } else {
        format!("{path}?{encoded}")
    };
    if let Ok(uri) = path_and_query.parse::<Uri>() {
        *request.uri_mut() = uri;
    }

    next.run(request).await
}

pub async fn rate_limit(
    State(state): State<Arc<RelayState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.allow() {
            return json_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
        }
    }
    next.run(request).await
}
