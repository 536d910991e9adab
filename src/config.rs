use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top level configuration: a list of HTTP and/or UDP relays, plus the
/// point filters that may be attached to their outputs.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default, rename = "http")]
    pub http_relays: Vec<HttpRelayConfig>,
    #[serde(default, rename = "udp")]
    pub udp_relays: Vec<UdpRelayConfig>,
    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpRelayConfig {
    /// Identifies the relay. A synthetic scheme://addr name is used when empty.
    #[serde(default)]
    pub name: Option<String>,

    /// Listening host:port.
    pub bind_addr: String,

    /// Path to a combined certificate + key PEM. Enables HTTPS when set.
    #[serde(default)]
    pub ssl_combined_pem: Option<String>,

    /// Retention policy injected into forwarded queries when the client
    /// did not provide one.
    #[serde(default)]
    pub default_retention_policy: Option<String>,

    /// Status code returned by /ping (204 when unset).
    #[serde(default)]
    pub default_ping_response: Option<u16>,

    /// Requests admitted per second. 0 disables rate limiting.
    #[serde(default)]
    pub rate_limit: u64,

    /// Burst allowed by the rate limiter.
    #[serde(default)]
    pub burst_limit: u64,

    /// Timeout for /health backend probes, in milliseconds. 0 means no timeout.
    #[serde(default)]
    pub health_timeout_ms: u64,

    #[serde(default, rename = "output")]
    pub outputs: Vec<HttpOutputConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpOutputConfig {
    /// Name of the backend server. Defaults to the location.
    #[serde(default)]
    pub name: Option<String>,

    /// URL prefix of the backend, for example https://influxdb.example.com/
    pub location: String,

    #[serde(default)]
    pub endpoints: HttpEndpointConfig,

    /// Per-backend write timeout, as a duration string (default "10s").
    #[serde(default)]
    pub timeout: Option<String>,

    /// Buffer failed writes up to this many megabytes. 0 disables retry
    /// buffering for the backend.
    #[serde(default)]
    pub buffer_size_mb: usize,

    /// Maximum coalesced batch size in KB (default 512).
    #[serde(default)]
    pub max_batch_kb: usize,

    /// Maximum delay between retry attempts, as a duration string
    /// (default "10s").
    #[serde(default)]
    pub max_delay_interval: Option<String>,

    /// Accept self signed backend certificates. Development only.
    #[serde(default)]
    pub skip_tls_verification: bool,
}

/// Remote endpoint paths, appended to the output location.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HttpEndpointConfig {
    #[serde(default)]
    pub write: String,
    #[serde(default)]
    pub write_prom: String,
    #[serde(default)]
    pub ping: String,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UdpRelayConfig {
    #[serde(default)]
    pub name: Option<String>,

    pub bind_addr: String,

    /// Precision of incoming and outgoing timestamps (ns, us, ms or s).
    #[serde(default)]
    pub precision: Option<String>,

    /// Size of the buffer each datagram is read into.
    #[serde(default)]
    pub read_buffer: usize,

    #[serde(default, rename = "output")]
    pub outputs: Vec<UdpOutputConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UdpOutputConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// host:port of the backend server.
    pub location: String,

    /// Maximum output payload size, default 1024.
    #[serde(default)]
    pub mtu: usize,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FilterConfig {
    /// How the regex result is interpreted. Informational.
    #[serde(default, rename = "type")]
    pub filter_type: Option<String>,

    /// Applied to every tag key of every point sent to the outputs below.
    #[serde(default)]
    pub tag_expression: Option<String>,

    /// Applied to the measurement of every point sent to the outputs below.
    #[serde(default)]
    pub measurement_expression: Option<String>,

    /// Backend names the expressions apply to.
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A filter with its expressions compiled. Compilation happens once at
/// startup and a compile error refuses the whole configuration.
#[derive(Debug, Clone)]
pub struct Filter {
    pub tag_regexp: Option<Regex>,
    pub measurement_regexp: Option<Regex>,
    pub outputs: Vec<String>,
}

impl FilterConfig {
    pub fn compile(&self) -> Result<Filter> {
        let tag_regexp = match &self.tag_expression {
            Some(expr) => Some(
                Regex::new(expr).with_context(|| format!("invalid tag-expression {expr:?}"))?,
            ),
            None => None,
        };
        let measurement_regexp = match &self.measurement_expression {
            Some(expr) => Some(
                Regex::new(expr)
                    .with_context(|| format!("invalid measurement-expression {expr:?}"))?,
            ),
            None => None,
        };
        Ok(Filter {
            tag_regexp,
            measurement_regexp,
            outputs: self.outputs.clone(),
        })
    }
}

pub fn compile_filters(filters: &[FilterConfig]) -> Result<Vec<Filter>> {
    filters.iter().map(FilterConfig::compile).collect()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("could not read {}", path.as_ref().display()))?;
        let mut config: Config = toml::from_str(&raw).context("could not parse configuration")?;

        for relay in &mut config.http_relays {
            for output in &mut relay.outputs {
                output.endpoints = normalize_endpoints(&output.location, &output.endpoints);
            }
        }

        Ok(config)
    }
}

/// Collapses the double slash that would appear when a location ending
/// with '/' is joined with an endpoint starting with '/'.
fn normalize_endpoints(location: &str, endpoints: &HttpEndpointConfig) -> HttpEndpointConfig {
    if !location.ends_with('/') {
        return endpoints.clone();
    }

    let strip = |e: &str| e.strip_prefix('/').unwrap_or(e).to_string();

    HttpEndpointConfig {
        write: strip(&endpoints.write),
        write_prom: strip(&endpoints.write_prom),
        ping: strip(&endpoints.ping),
        query: strip(&endpoints.query),
    }
}

/// Parses duration strings of the shape used by the configuration file,
/// such as "10s", "500ms" or "1m".
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("missing unit in duration {value:?}"))?;
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration {value:?}"))?;

    let duration = match unit {
        "ns" => Duration::from_nanos(amount),
        "us" | "µs" => Duration::from_micros(amount),
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 3600),
        _ => bail!("unknown unit {unit:?} in duration {value:?}"),
    };

    Ok(duration)
}
