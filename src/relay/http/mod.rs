use crate::backend::HttpBackend;
use crate::config::{Filter, HttpRelayConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

pub mod handlers;
pub mod middlewares;
pub mod response;

pub const DEFAULT_PING_RESPONSE: StatusCode = StatusCode::NO_CONTENT;

/// A relay for HTTP writes: one listener fanning out to a set of backends.
pub struct HttpRelay {
    state: Arc<RelayState>,
    handle: Handle,
    closing: AtomicBool,
}

/// The parts of a relay its request handlers work against.
pub struct RelayState {
    pub name: String,
    pub bind_addr: String,
    pub ssl_combined_pem: Option<String>,
    pub verbose: bool,
    pub default_retention_policy: Option<String>,
    pub ping_response: StatusCode,
    pub rate_limiter: Option<RateLimiter>,
    pub health_timeout: Option<Duration>,
    pub backends: Vec<Arc<HttpBackend>>,
}

impl HttpRelay {
    pub fn new(
        cfg: &HttpRelayConfig,
        verbose: bool,
        filters: &[Filter],
    ) -> Result<Arc<HttpRelay>> {
        let scheme = if cfg.ssl_combined_pem.is_some() {
            "https"
        } else {
            "http"
        };
        let name = match &cfg.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{scheme}://{}", cfg.bind_addr),
        };

        let ping_response = match cfg.default_ping_response {
            Some(code) => StatusCode::from_u16(code)
                .with_context(|| format!("invalid default-ping-response {code}"))?,
            None => DEFAULT_PING_RESPONSE,
        };

        let backends = cfg
            .outputs
            .iter()
            .map(|output| HttpBackend::new(output, filters).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let rate_limiter = (cfg.rate_limit > 0)
            .then(|| RateLimiter::new(cfg.rate_limit, cfg.burst_limit));

        let health_timeout =
            (cfg.health_timeout_ms > 0).then(|| Duration::from_millis(cfg.health_timeout_ms));

        Ok(Arc::new(HttpRelay {
            state: Arc::new(RelayState {
                name,
                bind_addr: cfg.bind_addr.clone(),
                ssl_combined_pem: cfg.ssl_combined_pem.clone(),
                verbose,
                default_retention_policy: cfg.default_retention_policy.clone(),
                ping_response,
                rate_limiter,
                health_timeout,
                backends,
            }),
            handle: Handle::new(),
            closing: AtomicBool::new(false),
        }))
    }

    /// The relay routing table with its middleware chain. Requests run
    /// through log, body, query and rate middlewares before the handler.
    pub fn router(&self) -> Router {
        let state = Arc::clone(&self.state);

        Router::new()
            .route("/write", any(handlers::write))
            .route("/api/v1/prom/write", any(handlers::prom_write))
            .route("/ping", any(handlers::ping))
            .route("/status", any(handlers::status))
            .route("/admin", any(handlers::admin))
            .route("/admin/flush", any(handlers::flush))
            .route("/health", any(handlers::health))
            .fallback(handlers::not_found)
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                middlewares::rate_limit,
            ))
            .with_state(state)
    }
}

#[async_trait]
impl super::Relay for HttpRelay {
    fn name(&self) -> String {
        self.state.name.clone()
    }

    async fn run(&self) -> Result<()> {
        let listener = std::net::TcpListener::bind(&self.state.bind_addr)
            .with_context(|| format!("could not bind {}", self.state.bind_addr))?;

        if self.state.verbose {
            info!(relay = %self.state.name, addr = %self.state.bind_addr, "starting relay");
        }

        let app = self.router().into_make_service();

        let served = match &self.state.ssl_combined_pem {
            Some(pem) => {
                // The combined PEM carries both the certificate chain and
                // the private key.
                let tls = RustlsConfig::from_pem_file(pem, pem)
                    .await
                    .with_context(|| format!("could not load certificate {pem}"))?;
                axum_server::from_tcp_rustls(listener, tls)
                    .handle(self.handle.clone())
                    .serve(app)
                    .await
            }
            None => {
                axum_server::from_tcp(listener)
                    .handle(self.handle.clone())
                    .serve(app)
                    .await
            }
        };

        if self.closing.load(Ordering::Acquire) {
            return Ok(());
        }
        served.map_err(Into::into)
    }

    fn stop(&self) {
        self.closing.store(true, Ordering::Release);
        // Stop accepting; in-flight handlers run to completion.
        self.handle.graceful_shutdown(None);
    }
}

/// Non-blocking token bucket: one token per request, refilled at the
/// configured rate up to the burst capacity.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl RateLimiter {
    pub fn new(rate: u64, burst: u64) -> RateLimiter {
        let burst = if burst == 0 { 1 } else { burst };
        RateLimiter {
            rate: rate as f64,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                refilled: Instant::now(),
            }),
        }
    }

    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.refilled = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
