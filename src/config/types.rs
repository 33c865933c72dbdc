use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Deserialize a `Duration` from a humantime string (`"20s"`, `"5m"`).
/// `"off"` and `"0"` both mean "no duration" and come back as `None`.
fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("off") | Some("0") => Ok(None),
        Some(s) => humantime::parse_duration(s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Top-level proxy configuration — the design-level option table of the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: String,
    pub admin_listen: String,

    pub flags: Flags,

    /// Maximum loopback recursion depth. 0 means the default (9),
    /// negative disables loopback entirely.
    pub max_loopbacks: i32,

    /// Status served when no route matches.
    pub default_http_status: u16,

    pub transport: TransportConfig,
    pub upgrade: UpgradeConfig,
    pub access_log: AccessLogConfig,
    pub tracing: TracingConfig,
    pub passive_health: PassiveHealthConfig,
    pub body: BodyConfig,

    /// Optional process-wide rate limit applied before route lookup.
    pub global_ratelimit: Option<RatelimitSettings>,
    /// Optional process-wide LIFO queue wrapping every request.
    pub global_lifo: Option<LifoSettings>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9090".to_string(),
            admin_listen: "0.0.0.0:9911".to_string(),
            flags: Flags::default(),
            max_loopbacks: 0,
            default_http_status: 404,
            transport: TransportConfig::default(),
            upgrade: UpgradeConfig::default(),
            access_log: AccessLogConfig::default(),
            tracing: TracingConfig::default(),
            passive_health: PassiveHealthConfig::default(),
            body: BodyConfig::default(),
            global_ratelimit: None,
            global_lifo: None,
        }
    }
}

pub const DEFAULT_MAX_LOOPBACKS: i32 = 9;

impl ProxyConfig {
    /// Effective loopback bound after applying the 0-means-default rule.
    pub fn effective_max_loopbacks(&self) -> i32 {
        if self.max_loopbacks == 0 {
            DEFAULT_MAX_LOOPBACKS
        } else {
            self.max_loopbacks
        }
    }
}

/// Behavior toggles of the proxy core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// Skip TLS verification on outbound connections.
    pub insecure: bool,
    /// Keep a deep clone of the original request/response for filters.
    pub preserve_original: bool,
    /// Default the outgoing Host to the incoming Host header.
    pub preserve_host: bool,
    /// Serve a JSON introspection document instead of dispatching.
    pub debug: bool,
    /// Strip hop-by-hop headers before forwarding.
    pub hop_headers_removal: bool,
    /// Forward the raw request path bytes even if a filter re-parsed the URL.
    pub patch_path: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Per-host idle connection pool size.
    pub idle_connections_per_host: usize,

    /// Cadence of the forced idle-connection sweep, defeating DNS pinning.
    /// `"off"` disables the sweep.
    #[serde(deserialize_with = "deserialize_opt_duration")]
    pub close_idle_conns_period: Option<Duration>,

    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,

    #[serde(deserialize_with = "deserialize_duration")]
    pub keep_alive: Duration,

    /// Deadline for the backend's response head after the request was sent.
    #[serde(deserialize_with = "deserialize_duration")]
    pub response_header_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_connections_per_host: 64,
            close_idle_conns_period: Some(Duration::from_secs(20)),
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            response_header_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Enable `Connection: Upgrade` pass-through tunneling.
    pub experimental_upgrade: bool,
    /// Write an audit record and mirror backend bytes for upgraded requests.
    pub experimental_upgrade_audit: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    /// When set, the access log is off unless a filter enables it per request.
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Operation name recorded on the ingress span.
    pub initial_operation_name: String,
    /// Emit per-filter start/end events on the filter spans.
    pub log_filter_events: bool,
    /// Emit streamHeaders / streamBody events while copying the response.
    pub log_stream_events: bool,
    /// Skip creating the request_filters / response_filters spans.
    pub disable_filter_spans: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            initial_operation_name: "ingress".to_string(),
            log_filter_events: false,
            log_stream_events: false,
            disable_filter_spans: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassiveHealthConfig {
    pub enabled: bool,
    /// Stop dropping endpoints once more than this share already dropped.
    pub max_unhealthy_endpoints_ratio: f64,
    /// Endpoints below this request count keep drop probability 0.
    pub min_requests: u64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub stats_reset_period: Duration,
    pub min_drop_probability: f64,
    pub max_drop_probability: f64,
}

impl Default for PassiveHealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_unhealthy_endpoints_ratio: 0.3,
            min_requests: 10,
            stats_reset_period: Duration::from_secs(60),
            min_drop_probability: 0.0,
            max_drop_probability: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyConfig {
    /// Bytes of request body the buffering reader keeps for replay.
    pub max_body_bytes: usize,
    /// Process-wide cap on memory spent buffering bodies at once.
    pub max_memory_body_parsing: usize,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            max_memory_body_parsing: 64 * 1024 * 1024,
        }
    }
}

/// Settings identifying one rate limiter: `max_hits` requests per
/// `time_window`. Equal settings share a limiter in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RatelimitSettings {
    pub max_hits: u64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub time_window: Duration,
}

/// Settings for one LIFO queue: bounded concurrency plus a bounded,
/// last-in-first-out admission stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifoSettings {
    pub max_concurrency: usize,
    pub max_queue_size: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for LifoSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 100,
            max_queue_size: 100,
            timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Route file — the declarative input of the built-in file route source.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteFile {
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

/// One route as written in the route file. Compiled into `routing::Route`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub id: String,

    /// Path predicate: exact (`/api/users`) or prefix (`/api/*`).
    pub path: String,

    /// Allowed methods; empty means all.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Ordered filter chain; names resolved through the filter registry.
    #[serde(default)]
    pub filters: Vec<FilterSpec>,

    /// Backend address (`http://host:port`), or one of the specials
    /// `<shunt>`, `<loopback>`, `<dynamic>`. Ignored when `lb_endpoints`
    /// is non-empty.
    #[serde(default)]
    pub backend: String,

    #[serde(default)]
    pub lb_endpoints: Vec<String>,

    #[serde(default)]
    pub lb_algorithm: Option<String>,

    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub lb_fade_in_duration: Option<Duration>,

    #[serde(default = "default_fade_in_exponent")]
    pub lb_fade_in_exponent: f64,
}

fn default_fade_in_exponent() -> f64 {
    1.0
}

/// A filter invocation: name plus positional string arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.default_http_status, 404);
        assert_eq!(config.effective_max_loopbacks(), 9);
        assert_eq!(config.transport.idle_connections_per_host, 64);
        assert_eq!(
            config.transport.close_idle_conns_period,
            Some(Duration::from_secs(20))
        );
        assert!(!config.flags.debug);
    }

    #[test]
    fn test_max_loopbacks_rules() {
        let mut config = ProxyConfig {
            max_loopbacks: 3,
            ..Default::default()
        };
        assert_eq!(config.effective_max_loopbacks(), 3);
        config.max_loopbacks = -1;
        assert_eq!(config.effective_max_loopbacks(), -1);
    }

    #[test]
    fn test_parse_durations_and_off() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [transport]
            close_idle_conns_period = "off"
            response_header_timeout = "150ms"
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.close_idle_conns_period, None);
        assert_eq!(
            config.transport.response_header_timeout,
            Duration::from_millis(150)
        );
    }

    #[test]
    fn test_parse_route_file() {
        let file: RouteFile = toml::from_str(
            r#"
            [[routes]]
            id = "api"
            path = "/api/*"
            methods = ["GET", "POST"]
            lb_endpoints = ["http://10.0.0.1:8080", "http://10.0.0.2:8080"]
            lb_algorithm = "roundRobin"
            lb_fade_in_duration = "3m"

            [[routes]]
            id = "health"
            path = "/healthz"
            backend = "<shunt>"
            filters = [{ name = "status", args = ["204"] }]
            "#,
        )
        .unwrap();
        assert_eq!(file.routes.len(), 2);
        assert_eq!(file.routes[0].lb_endpoints.len(), 2);
        assert_eq!(
            file.routes[0].lb_fade_in_duration,
            Some(Duration::from_secs(180))
        );
        assert_eq!(file.routes[1].backend, "<shunt>");
        assert_eq!(file.routes[1].filters[0].name, "status");
    }

    #[test]
    fn test_global_gates_parse() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [global_ratelimit]
            max_hits = 100
            time_window = "1s"

            [global_lifo]
            max_concurrency = 50
            max_queue_size = 200
            timeout = "2s"
            "#,
        )
        .unwrap();
        let rl = config.global_ratelimit.unwrap();
        assert_eq!(rl.max_hits, 100);
        assert_eq!(rl.time_window, Duration::from_secs(1));
        assert_eq!(config.global_lifo.unwrap().max_queue_size, 200);
    }
}
