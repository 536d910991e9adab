use crate::config::{Filter, HttpEndpointConfig, HttpOutputConfig};
use crate::parsing::lineproto;
use async_trait::async_trait;
use bytes::Bytes;
use influxdb_line_protocol::ParsedLine;
use regex::Regex;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod retry;

pub use retry::RetryBuffer;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_DELAY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_BATCH_SIZE_KB: usize = 512;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

#[derive(Debug, Error)]
pub enum PostError {
    #[error("retry buffer full")]
    BufferFull,
    #[error("invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// What came back from one POST against a backend.
#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub content_encoding: Option<HeaderValue>,
    pub body: Bytes,
}

impl ResponseData {
    pub fn accepted() -> Self {
        ResponseData {
            status: StatusCode::ACCEPTED,
            content_type: None,
            content_encoding: None,
            body: Bytes::new(),
        }
    }
}

/// Performs one POST and reports on itself. Realized by the direct HTTP
/// client and by the retry buffer wrapping one.
#[async_trait]
pub trait Poster: Send + Sync {
    async fn post(
        &self,
        payload: Bytes,
        query: &str,
        auth: Option<&str>,
        endpoint: &str,
    ) -> Result<ResponseData, PostError>;

    fn stats(&self) -> HashMap<String, String>;
}

/// Direct HTTP client against a single backend location.
pub struct SimplePoster {
    client: reqwest::Client,
    location: String,
}

impl SimplePoster {
    pub fn new(
        location: String,
        timeout: Duration,
        skip_tls_verification: bool,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_tls_verification)
            .build()?;

        Ok(SimplePoster { client, location })
    }
}

#[async_trait]
impl Poster for SimplePoster {
    async fn post(
        &self,
        payload: Bytes,
        query: &str,
        auth: Option<&str>,
        endpoint: &str,
    ) -> Result<ResponseData, PostError> {
        let mut url = Url::parse(&format!("{}{}", self.location, endpoint))?;
        if !query.is_empty() {
            url.set_query(Some(query));
        }

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/plain")
            .body(payload);
        if let Some(auth) = auth {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = request.send().await?;
        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let content_encoding = response.headers().get(CONTENT_ENCODING).cloned();
        let body = response.bytes().await?;

        Ok(ResponseData {
            status,
            content_type,
            content_encoding,
            body,
        })
    }

    fn stats(&self) -> HashMap<String, String> {
        let mut stats = HashMap::new();
        stats.insert("location".to_string(), self.location.clone());
        stats
    }
}

/// One configured output of an HTTP relay: its poster (retry wrapped when
/// buffering is configured), endpoint paths, and the point filters that
/// apply to it.
pub struct HttpBackend {
    pub name: String,
    pub location: String,
    pub endpoints: HttpEndpointConfig,
    poster: Arc<dyn Poster>,
    retry: Option<Arc<RetryBuffer>>,
    tag_regexps: Vec<Regex>,
    measurement_regexps: Vec<Regex>,
}

impl HttpBackend {
    pub fn new(cfg: &HttpOutputConfig, filters: &[Filter]) -> anyhow::Result<HttpBackend> {
        let name = cfg.name.clone().unwrap_or_else(|| cfg.location.clone());

        let timeout = match &cfg.timeout {
            Some(t) => crate::config::parse_duration(t)?,
            None => DEFAULT_HTTP_TIMEOUT,
        };

        let simple = Arc::new(SimplePoster::new(
            cfg.location.clone(),
            timeout,
            cfg.skip_tls_verification,
        )?);

        // A retry buffer per backend serializes retries against it.
        let (poster, retry): (Arc<dyn Poster>, Option<Arc<RetryBuffer>>) =
            if cfg.buffer_size_mb > 0 {
                let max_interval = match &cfg.max_delay_interval {
                    Some(d) => crate::config::parse_duration(d)?,
                    None => DEFAULT_MAX_DELAY_INTERVAL,
                };
                let max_batch = if cfg.max_batch_kb > 0 {
                    cfg.max_batch_kb * KB
                } else {
                    DEFAULT_BATCH_SIZE_KB * KB
                };

                let buffer = RetryBuffer::new(
                    cfg.buffer_size_mb * MB,
                    max_batch,
                    max_interval,
                    simple,
                );
                (buffer.clone(), Some(buffer))
            } else {
                (simple, None)
            };

        let mut tag_regexps = Vec::new();
        let mut measurement_regexps = Vec::new();
        for filter in filters {
            if !filter.outputs.iter().any(|o| *o == name) {
                continue;
            }
            if let Some(regexp) = &filter.tag_regexp {
                tag_regexps.push(regexp.clone());
            }
            if let Some(regexp) = &filter.measurement_regexp {
                measurement_regexps.push(regexp.clone());
            }
        }

        Ok(HttpBackend {
            name,
            location: cfg.location.clone(),
            endpoints: cfg.endpoints.clone(),
            poster,
            retry,
            tag_regexps,
            measurement_regexps,
        })
    }

    pub async fn post(
        &self,
        payload: Bytes,
        query: &str,
        auth: Option<&str>,
        endpoint: &str,
    ) -> Result<ResponseData, PostError> {
        self.poster.post(payload, query, auth, endpoint).await
    }

    pub fn stats(&self) -> HashMap<String, String> {
        self.poster.stats()
    }

    pub fn retry_buffer(&self) -> Option<&Arc<RetryBuffer>> {
        self.retry.as_ref()
    }

    /// A request passes for this backend only when every point matches all
    /// the measurement expressions and every tag key of every point matches
    /// all the tag expressions.
    pub fn accepts(&self, points: &[ParsedLine<'_>]) -> bool {
        for point in points {
            let measurement = lineproto::measurement(point);
            for regexp in &self.measurement_regexps {
                if !regexp.is_match(measurement) {
                    return false;
                }
            }

            for key in lineproto::tag_keys(point) {
                for regexp in &self.tag_regexps {
                    if !regexp.is_match(key) {
                        return false;
                    }
                }
            }
        }

        true
    }
}
