use super::response::{forward_response, json_response, method_not_allowed};
use super::RelayState;
use crate::backend::{HttpBackend, ResponseData};
use crate::parsing::lineproto::{self, Precision};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{error, info};
use url::form_urlencoded;

/// Line protocol ingress: parse, normalize, fan out to every backend whose
/// filters accept the points.
pub async fn write(State(state): State<Arc<RelayState>>, request: Request) -> Response {
    if let Some(response) = reject_non_post(&request) {
        return response;
    }

    let query = request.uri().query().unwrap_or("").to_string();
    let precision = Precision::from_query(query_param(&query, "precision").as_deref());
    let auth = auth_header(&request);

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    let Ok(text) = std::str::from_utf8(&body) else {
        return json_response(StatusCode::BAD_REQUEST, "unable to parse points");
    };
    let points = match lineproto::parse_points(text) {
        Ok(points) => points,
        Err(_) => return json_response(StatusCode::BAD_REQUEST, "unable to parse points"),
    };

    let mut normalized = String::with_capacity(body.len() + points.len());
    lineproto::write_points(&points, precision, unix_nanos(), &mut normalized);
    let payload = Bytes::from(normalized);

    let (tx, rx) = mpsc::channel(state.backends.len().max(1));
    for backend in &state.backends {
        if !backend.accepts(&points) {
            if state.verbose {
                info!(
                    relay = %state.name,
                    backend = %backend.name,
                    "request invalidated by filter expression"
                );
            }
            continue;
        }

        spawn_post(
            Arc::clone(&state),
            Arc::clone(backend),
            payload.clone(),
            query.clone(),
            auth.clone(),
            backend.endpoints.write.clone(),
            tx.clone(),
        );
    }
    drop(tx);

    aggregate_writes(&state, rx).await
}

/// Prometheus remote write ingress: the body is forwarded verbatim.
pub async fn prom_write(State(state): State<Arc<RelayState>>, request: Request) -> Response {
    if let Some(response) = reject_non_post(&request) {
        return response;
    }

    let query = request.uri().query().unwrap_or("").to_string();
    let auth = auth_header(&request);

    let payload = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    let (tx, rx) = mpsc::channel(state.backends.len().max(1));
    for backend in &state.backends {
        spawn_post(
            Arc::clone(&state),
            Arc::clone(backend),
            payload.clone(),
            query.clone(),
            auth.clone(),
            backend.endpoints.write_prom.clone(),
            tx.clone(),
        );
    }
    drop(tx);

    aggregate_writes(&state, rx).await
}

pub async fn ping(State(state): State<Arc<RelayState>>, request: Request) -> Response {
    if request.method() != Method::GET && request.method() != Method::HEAD {
        return method_not_allowed(None);
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = state.ping_response;
    response.headers_mut().insert(
        "X-InfluxDB-Version",
        HeaderValue::from_static("relay"),
    );
    if state.ping_response != StatusCode::NO_CONTENT {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    }
    response
}

pub async fn status(State(state): State<Arc<RelayState>>, request: Request) -> Response {
    if request.method() != Method::GET && request.method() != Method::HEAD {
        return method_not_allowed(None);
    }

    let stats: HashMap<String, HashMap<String, String>> = state
        .backends
        .iter()
        .map(|backend| (backend.name.clone(), backend.stats()))
        .collect();

    json_response(StatusCode::OK, &stats)
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    healthy: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    problem: HashMap<String, String>,
}

/// Pings every backend concurrently and reports which answered in time.
pub async fn health(State(state): State<Arc<RelayState>>, _request: Request) -> Response {
    let probes = state.backends.iter().map(|backend| {
        let timeout = state.health_timeout;
        async move {
            let started = Instant::now();
            let result = probe_backend(backend, timeout).await;
            (backend.name.clone(), result, started.elapsed())
        }
    });

    let mut healthy = HashMap::new();
    let mut problem = HashMap::new();
    for (name, result, duration) in join_all(probes).await {
        match result {
            Ok(()) => {
                healthy.insert(name, format!("OK. Time taken {duration:?}"));
            }
            Err(err) => {
                if state.verbose {
                    info!(relay = %state.name, backend = %name, error = %err, "health probe failed");
                }
                problem.insert(name, format!("KO. {err}"));
            }
        }
    }

    let status = if problem.len() == state.backends.len() {
        "critical"
    } else if !problem.is_empty() {
        "problem"
    } else {
        "healthy"
    };

    json_response(
        StatusCode::OK,
        &HealthReport {
            status,
            healthy,
            problem,
        },
    )
}

async fn probe_backend(
    backend: &HttpBackend,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    let client = builder.build()?;

    let response = client
        .get(format!("{}{}", backend.location, backend.endpoints.ping))
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("unexpected status code {}", response.status().as_u16());
    }
    Ok(())
}

/// Forwards a raw query body to every backend's query endpoint.
pub async fn admin(State(state): State<Arc<RelayState>>, request: Request) -> Response {
    if request.method() != Method::POST {
        return method_not_allowed(Some("POST"));
    }

    let mut headers = request.headers().clone();
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    let client = reqwest::Client::new();
    let (tx, mut rx) = mpsc::channel(state.backends.len().max(1));
    for backend in &state.backends {
        let state = Arc::clone(&state);
        let backend = Arc::clone(backend);
        let client = client.clone();
        let headers = headers.clone();
        let body = body.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let url = format!("{}{}", backend.location, backend.endpoints.query);
            let result = client.post(url).headers(headers).body(body).send().await;

            let message = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        error!(
                            relay = %state.name,
                            backend = %backend.name,
                            status = %status,
                            "5xx response forwarding query"
                        );
                    }
                    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
                    let content_encoding =
                        response.headers().get(header::CONTENT_ENCODING).cloned();
                    match response.bytes().await {
                        Ok(bytes) => Some(ResponseData {
                            status,
                            content_type,
                            content_encoding,
                            body: bytes,
                        }),
                        Err(_) => None,
                    }
                }
                Err(err) => {
                    error!(
                        relay = %state.name,
                        backend = %backend.name,
                        error = %err,
                        "problem forwarding query to backend"
                    );
                    None
                }
            };
            let _ = tx.send(message).await;
        });
    }
    drop(tx);

    while let Some(result) = rx.recv().await {
        let Some(response) = result else { continue };
        match response.status.as_u16() / 100 {
            2 => return StatusCode::NO_CONTENT.into_response(),
            4 => return forward_response(&response),
            _ => {}
        }
    }

    json_response(StatusCode::SERVICE_UNAVAILABLE, "unable to forward query")
}

/// Flushes the retry buffer of every backend that carries one.
pub async fn flush(State(state): State<Arc<RelayState>>, _request: Request) -> Response {
    info!(relay = %state.name, "flushing buffers");

    for backend in &state.backends {
        if let Some(buffer) = backend.retry_buffer() {
            if state.verbose {
                info!(relay = %state.name, backend = %backend.name, "flushing");
            }
            buffer.flush();
        }
    }

    json_response(StatusCode::OK, "OK")
}

pub async fn not_found() -> Response {
    json_response(StatusCode::NOT_FOUND, "Not Found")
}

fn reject_non_post(request: &Request) -> Option<Response> {
    if request.method() == Method::POST {
        return None;
    }

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("POST"));
        Some(response)
    } else {
        Some(method_not_allowed(Some("POST")))
    }
}

fn auth_header(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

fn query_param(query: &str, name: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or_default()
}

fn spawn_post(
    state: Arc<RelayState>,
    backend: Arc<HttpBackend>,
    payload: Bytes,
    query: String,
    auth: Option<String>,
    endpoint: String,
    tx: mpsc::Sender<Option<ResponseData>>,
) {
    tokio::spawn(async move {
        match backend
            .post(payload, &query, auth.as_deref(), &endpoint)
            .await
        {
            Ok(response) => {
                if response.status.is_server_error() {
                    error!(
                        relay = %state.name,
                        backend = %backend.name,
                        status = %response.status,
                        "5xx response from backend"
                    );
                }
                let _ = tx.send(Some(response)).await;
            }
            Err(err) => {
                error!(
                    relay = %state.name,
                    backend = %backend.name,
                    error = %err,
                    "problem posting to backend"
                );
                let _ = tx.send(None).await;
            }
        }
    });
}

/// First terminal outcome wins: a 202 signals buffering downstream, any
/// other 2xx collapses to 204, a 4xx is the client's own mistake and comes
/// back verbatim. Only backend failures are left, so report 503.
async fn aggregate_writes(
    state: &RelayState,
    mut rx: mpsc::Receiver<Option<ResponseData>>,
) -> Response {
    while let Some(result) = rx.recv().await {
        let Some(response) = result else { continue };
        match response.status.as_u16() / 100 {
            2 => {
                if response.status == StatusCode::ACCEPTED {
                    if state.verbose {
                        info!(relay = %state.name, "could not reach backend, buffering");
                    }
                    return plain_status(StatusCode::ACCEPTED);
                }
                return plain_status(StatusCode::NO_CONTENT);
            }
            4 => return forward_response(&response),
            _ => {}
        }
    }

    json_response(StatusCode::SERVICE_UNAVAILABLE, "unable to write points")
}

fn plain_status(status: StatusCode) -> Response {
    let mut response = status.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}
