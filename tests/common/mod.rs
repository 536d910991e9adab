#![allow(dead_code)]
/// HTTP testing utilities: an in-memory relay driven through its router,
/// pointed at wiremock backends.
use anyhow::Result;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use std::time::Duration;
use tower::ServiceExt; // for `oneshot`
use tsrelay::config::{
    compile_filters, FilterConfig, HttpEndpointConfig, HttpOutputConfig, HttpRelayConfig,
};
use tsrelay::relay::http::HttpRelay;

/// An output pointing at a mock backend, with the standard endpoint paths.
pub fn output(name: &str, location: &str) -> HttpOutputConfig {
    HttpOutputConfig {
        name: Some(name.to_string()),
        location: location.to_string(),
        endpoints: HttpEndpointConfig {
            write: "/write".to_string(),
            write_prom: "/api/v1/prom/write".to_string(),
            ping: "/ping".to_string(),
            query: "/query".to_string(),
        },
        ..Default::default()
    }
}

pub fn relay_config(outputs: Vec<HttpOutputConfig>) -> HttpRelayConfig {
    HttpRelayConfig {
        name: Some("test-relay".to_string()),
        bind_addr: "127.0.0.1:0".to_string(),
        health_timeout_ms: 2000,
        outputs,
        ..Default::default()
    }
}

pub struct TestRelay {
    router: axum::Router,
}

impl TestRelay {
    pub fn new(cfg: HttpRelayConfig) -> Self {
        Self::with_filters(cfg, &[])
    }

    pub fn with_filters(cfg: HttpRelayConfig, filters: &[FilterConfig]) -> Self {
        let filters = compile_filters(filters).expect("test filters must compile");
        let relay = HttpRelay::new(&cfg, false, &filters).expect("test relay must build");
        TestRelay {
            router: relay.router(),
        }
    }

    pub async fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<TestResponse> {
        let mut builder = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body))?;

        let response = self.router.clone().oneshot(request).await?;
        Ok(TestResponse::new(response).await)
    }

    pub async fn post(&self, path: &str, body: &str) -> Result<TestResponse> {
        self.request("POST", path, &[], body.as_bytes().to_vec())
            .await
    }

    pub async fn get(&self, path: &str) -> Result<TestResponse> {
        self.request("GET", path, &[], Vec::new()).await
    }

    /// Polls /status until the condition holds for the parsed stats document.
    pub async fn wait_for_status(
        &self,
        condition: impl Fn(&serde_json::Value) -> bool,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let response = self.get("/status").await?;
            let stats: serde_json::Value = response.json()?;
            if condition(&stats) {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("status condition not reached in time, last: {stats}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Test response wrapper for easier assertions.
pub struct TestResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl TestResponse {
    async fn new(response: axum::response::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap_or_default()
            .to_vec();

        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(Into::into)
    }

    pub fn assert_status(&self, expected: StatusCode) -> &Self {
        assert_eq!(
            self.status,
            expected,
            "Expected status {}, got {}. Body: {}",
            expected,
            self.status,
            self.body()
        );
        self
    }

    /// Asserts the exact JSON-encoded body of a terminal response.
    pub fn assert_json_body(&self, expected: &str) -> &Self {
        assert_eq!(
            self.body(),
            format!("\"{expected}\""),
            "unexpected response body"
        );
        self
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip encode");
    encoder.finish().expect("gzip finish")
}
