use crate::routing::Route;
use crate::scheduler::QueuePermit;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// State-bag keys that couple filters to the core. Filters write under
/// these names; the dispatcher reads them at defined points.
pub mod state_keys {
    /// `String` — full URL for the dynamic backend; wins over host/scheme.
    pub const DYNAMIC_BACKEND_URL: &str = "dynamic_backend_url";
    /// `String` — host for the dynamic backend.
    pub const DYNAMIC_BACKEND_HOST: &str = "dynamic_backend_host";
    /// `String` — scheme for the dynamic backend.
    pub const DYNAMIC_BACKEND_SCHEME: &str = "dynamic_backend_scheme";
    /// `Vec<RatelimitSettings>` — per-route rate limits, first denial wins.
    pub const ROUTE_RATELIMITS: &str = "route_ratelimits";
    /// `BreakerSettings` — circuit breaker for the outgoing host.
    pub const BREAKER_SETTINGS: &str = "circuit_breaker_settings";
    /// `Vec<Arc<LifoQueue>>` — per-route queues to pass before dispatch.
    pub const LIFO_QUEUES: &str = "lifo_queues";
    /// `Duration` — response deadline override for this request.
    pub const BACKEND_TIMEOUT: &str = "backend_timeout";
    /// `AccessLogSetting` — per-request access log override.
    pub const ACCESS_LOG: &str = "access_log_setting";
    /// `String` — key for consistent-hash endpoint selection.
    pub const CONSISTENT_HASH_KEY: &str = "consistent_hash_key";
    /// `String` — overrides the operation name of the proxy span.
    pub const PROXY_SPAN_NAME: &str = "proxy_span_name";
}

/// Filter-shared string→any map. Values are `Arc`ed so a loopback clone is
/// shallow: both contexts observe the same attached state.
#[derive(Default, Clone)]
pub struct StateBag {
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl StateBag {
    pub fn set<T: Any + Send + Sync>(&mut self, key: &str, value: T) {
        self.values.insert(key.to_string(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values.get(key)?.clone().downcast::<T>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }
}

/// Per-request access log override, attached by filters under
/// [`state_keys::ACCESS_LOG`].
///
/// Prefix semantics: a prefix below 10 matches the status class (`2` covers
/// 200–299), below 100 the decade (`41` covers 410–419), anything else the
/// exact code. With `enable = false` the match set is inverted: matching
/// statuses are *not* logged.
#[derive(Debug, Clone)]
pub struct AccessLogSetting {
    pub enable: bool,
    pub prefixes: Vec<u16>,
}

impl AccessLogSetting {
    fn prefix_matches(prefix: u16, status: u16) -> bool {
        if prefix < 10 {
            status / 100 == prefix
        } else if prefix < 100 {
            status / 10 == prefix
        } else {
            status == prefix
        }
    }

    /// Whether a response with `status` should be logged under this setting.
    pub fn allows(&self, status: u16) -> bool {
        if self.prefixes.is_empty() {
            return self.enable;
        }
        let matched = self
            .prefixes
            .iter()
            .any(|&p| Self::prefix_matches(p, status));
        if self.enable {
            matched
        } else {
            !matched
        }
    }
}

/// Resolve the access log decision from the optional per-request setting
/// and the process-wide default.
pub fn access_log_enabled(
    setting: Option<&AccessLogSetting>,
    default_disabled: bool,
    status: u16,
) -> bool {
    match setting {
        Some(s) => s.allows(status),
        None => !default_disabled,
    }
}

/// Immutable snapshot of a request or response head, kept when
/// `preserve_original` is set and rendered by debug mode.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Per-request state flowing through filters and dispatch.
///
/// Created once per incoming request; a loopback creates a detached clone
/// that takes over the body. Destroyed when the response body finishes.
pub struct RequestContext {
    pub method: Method,
    /// The outgoing URL; filters may rewrite path and query.
    pub uri: Uri,
    pub version: Version,
    /// Mutable outgoing headers, seeded from the incoming request.
    pub headers: HeaderMap,
    /// Path bytes exactly as the client sent them.
    pub raw_path: String,
    /// Request body; taken by the dispatcher (or handed to a loopback clone).
    pub body: Option<BoxBody>,
    /// Whether the incoming request announced a body at all. Gates retry.
    pub has_body: bool,
    /// Downstream upgrade handle; present until an upgrade dispatch takes it.
    pub on_upgrade: Option<hyper::upgrade::OnUpgrade>,

    /// Host header of the incoming request.
    pub incoming_host: String,
    /// Host the outgoing request targets; filters may overwrite.
    pub outgoing_host: String,

    pub client_addr: SocketAddr,
    pub start: Instant,

    pub route: Option<Arc<Route>>,
    pub path_params: Vec<(String, String)>,

    pub state_bag: StateBag,

    pub response: Option<hyper::Response<BoxBody>>,
    /// Response head before response filters ran, when preserved.
    pub original_response: Option<(StatusCode, HeaderMap)>,
    /// Incoming request head before filters ran, when preserved.
    pub original_request: Option<RequestHead>,

    pub loop_counter: i32,
    shunted: bool,
    /// Set when the response was committed out-of-band (upgrade tunnel).
    pub handled: bool,

    /// Messages of filter panics captured in debug mode.
    pub debug_filter_panics: Vec<String>,

    /// Slots held in per-route LIFO queues, released at request end.
    pub lifo_permits: Vec<QueuePermit>,

    /// Wall-clock bound for response streaming, set when a backend timeout
    /// applies to this request.
    pub stream_deadline: Option<Instant>,
}

impl RequestContext {
    /// The server adapter boxes the hyper body before building the context
    /// (`req.map(|b| b.boxed())`), keeping this constructible in tests.
    pub fn new(
        req: hyper::Request<BoxBody>,
        client_addr: SocketAddr,
        preserve_original: bool,
    ) -> Self {
        let (mut parts, body) = req.into_parts();

        let on_upgrade = parts.extensions.remove::<hyper::upgrade::OnUpgrade>();

        let incoming_host = parts
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let has_body = announces_body(&parts.headers);
        let raw_path = parts.uri.path().to_string();

        let original_request = preserve_original.then(|| RequestHead {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
        });

        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            raw_path,
            body: Some(body),
            has_body,
            on_upgrade,
            incoming_host,
            outgoing_host: String::new(),
            client_addr,
            start: Instant::now(),
            route: None,
            path_params: Vec::new(),
            state_bag: StateBag::default(),
            response: None,
            original_response: None,
            original_request,
            loop_counter: 0,
            shunted: false,
            handled: false,
            debug_filter_panics: Vec::new(),
            lifo_permits: Vec::new(),
            stream_deadline: None,
        }
    }

    /// Assign the matched route: wires path parameters and computes the
    /// default outgoing host (incoming Host when `preserve_host`, else the
    /// route's backend host).
    pub fn apply_route(
        &mut self,
        route: Arc<Route>,
        params: Vec<(String, String)>,
        preserve_host: bool,
    ) {
        self.outgoing_host = if preserve_host {
            self.incoming_host.clone()
        } else {
            route.backend_host().unwrap_or(&self.incoming_host).to_string()
        };
        self.path_params = params;
        self.route = Some(route);
    }

    /// Detached copy for loopback re-entry. The request head is deep-cloned
    /// (the clone reads the same method, URL and headers the client sent),
    /// the body moves over, and the state bag is shared shallowly.
    pub fn clone_for_loopback(&mut self) -> Self {
        Self {
            method: self.method.clone(),
            uri: self.uri.clone(),
            version: self.version,
            headers: self.headers.clone(),
            raw_path: self.raw_path.clone(),
            body: self.body.take(),
            has_body: self.has_body,
            on_upgrade: self.on_upgrade.take(),
            incoming_host: self.incoming_host.clone(),
            outgoing_host: String::new(),
            client_addr: self.client_addr,
            start: self.start,
            route: None,
            path_params: Vec::new(),
            state_bag: self.state_bag.clone(),
            response: None,
            original_response: None,
            original_request: self.original_request.clone(),
            loop_counter: self.loop_counter + 1,
            shunted: false,
            handled: false,
            debug_filter_panics: std::mem::take(&mut self.debug_filter_panics),
            lifo_permits: Vec::new(),
            stream_deadline: None,
        }
    }

    pub fn set_response(&mut self, resp: hyper::Response<BoxBody>, preserve_original: bool) {
        if preserve_original {
            self.original_response = Some((resp.status(), resp.headers().clone()));
        }
        self.response = Some(resp);
    }

    /// Mark the request as served locally; dispatch is skipped.
    pub fn shunt(&mut self) {
        self.shunted = true;
    }

    pub fn is_shunted(&self) -> bool {
        self.shunted
    }

    /// Synthesize an empty 404 when a shunted request reached response
    /// handling without any filter providing a response.
    pub fn ensure_default_response(&mut self) {
        if self.response.is_none() {
            self.response = Some(
                hyper::Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(empty_body())
                    .expect("static response"),
            );
        }
    }

    pub fn route_id(&self) -> &str {
        self.route.as_ref().map(|r| r.id.as_str()).unwrap_or("")
    }

    /// Protocol label for the `incoming.<proto>` counter.
    pub fn proto(&self) -> &'static str {
        match self.version {
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "HTTP/0.9",
        }
    }
}

fn announces_body(headers: &HeaderMap) -> bool {
    if let Some(cl) = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        return cl > 0;
    }
    headers.contains_key(http::header::TRANSFER_ENCODING)
}

// ---------------------------------------------------------------------------
// Request body capture — opt-in buffering with a process-wide memory cap.
// ---------------------------------------------------------------------------

/// Process-wide budget for in-memory body buffering. Prevents concurrent
/// capture-hungry requests from blowing up aggregate memory.
pub struct BodyCapturePool {
    available: std::sync::Mutex<usize>,
}

impl BodyCapturePool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            available: std::sync::Mutex::new(capacity),
        })
    }

    fn try_acquire(self: &Arc<Self>, bytes: usize) -> Option<CapturePermit> {
        let mut available = self.available.lock().expect("capture pool lock poisoned");
        if *available < bytes {
            return None;
        }
        *available -= bytes;
        Some(CapturePermit {
            pool: self.clone(),
            bytes,
        })
    }
}

pub struct CapturePermit {
    pool: Arc<BodyCapturePool>,
    bytes: usize,
}

impl Drop for CapturePermit {
    fn drop(&mut self) {
        let mut available = self
            .pool
            .available
            .lock()
            .expect("capture pool lock poisoned");
        *available += self.bytes;
    }
}

/// A request body after optional capture. Buffered bodies can be re-read
/// any number of times and always yield the same bytes.
pub enum CapturedBody {
    Buffered {
        bytes: Bytes,
        _permit: CapturePermit,
    },
    /// Too large (or budget exhausted): passes through untouched.
    Streaming(BoxBody),
}

impl CapturedBody {
    /// Buffer `body` when its announced size fits `max_body_bytes` and the
    /// pool admits it. Bodies above the limit, or without a declared
    /// length, stream through and do not take from the pool.
    pub async fn capture(
        body: BoxBody,
        content_length: Option<usize>,
        max_body_bytes: usize,
        pool: &Arc<BodyCapturePool>,
    ) -> Result<Self, BoxError> {
        let size = match content_length {
            Some(size) if size <= max_body_bytes => size,
            _ => return Ok(Self::Streaming(body)),
        };
        let permit = match pool.try_acquire(size.max(1)) {
            Some(p) => p,
            None => return Ok(Self::Streaming(body)),
        };
        let bytes = body.collect().await?.to_bytes();
        Ok(Self::Buffered {
            bytes,
            _permit: permit,
        })
    }

    /// A readable body; for buffered captures each call yields the same
    /// bytes, a streaming capture can be taken only once.
    pub fn replay(&mut self) -> BoxBody {
        match self {
            Self::Buffered { bytes, .. } => full_body(bytes.clone()),
            Self::Streaming(body) => std::mem::replace(body, empty_body()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_bag_typed_roundtrip() {
        let mut bag = StateBag::default();
        bag.set(state_keys::DYNAMIC_BACKEND_HOST, "example.org:8080".to_string());
        let host: Arc<String> = bag.get(state_keys::DYNAMIC_BACKEND_HOST).unwrap();
        assert_eq!(host.as_str(), "example.org:8080");

        // Wrong type comes back empty instead of panicking.
        assert!(bag.get::<u64>(state_keys::DYNAMIC_BACKEND_HOST).is_none());
    }

    #[test]
    fn test_state_bag_shallow_clone_shares_values() {
        let mut bag = StateBag::default();
        bag.set("k", 7u64);
        let cloned = bag.clone();
        let a: Arc<u64> = bag.get("k").unwrap();
        let b: Arc<u64> = cloned.get("k").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_access_log_prefix_semantics() {
        let classes = AccessLogSetting {
            enable: true,
            prefixes: vec![2],
        };
        assert!(classes.allows(200));
        assert!(classes.allows(299));
        assert!(!classes.allows(301));

        let decade = AccessLogSetting {
            enable: true,
            prefixes: vec![41],
        };
        assert!(decade.allows(418));
        assert!(!decade.allows(429));

        let exact = AccessLogSetting {
            enable: true,
            prefixes: vec![503],
        };
        assert!(exact.allows(503));
        assert!(!exact.allows(500));
    }

    #[test]
    fn test_access_log_disable_inverts() {
        let setting = AccessLogSetting {
            enable: false,
            prefixes: vec![2],
        };
        assert!(!setting.allows(204));
        assert!(setting.allows(500));
    }

    #[test]
    fn test_access_log_defaults() {
        assert!(access_log_enabled(None, false, 200));
        assert!(!access_log_enabled(None, true, 200));

        let enable_all = AccessLogSetting {
            enable: true,
            prefixes: vec![],
        };
        assert!(access_log_enabled(Some(&enable_all), true, 200));
    }

    #[test]
    fn test_access_log_prefix_zero_matches_nothing() {
        let setting = AccessLogSetting {
            enable: true,
            prefixes: vec![0],
        };
        for status in [200, 404, 500] {
            assert!(!setting.allows(status));
        }
    }

    fn test_request(path: &str, body: &'static str) -> hyper::Request<BoxBody> {
        hyper::Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("host", "proxy.test")
            .header("content-length", body.len().to_string())
            .header("x-flow-id", "abc123")
            .body(full_body(body))
            .unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_loopback_clone_preserves_request() {
        let mut ctx = RequestContext::new(test_request("/a/b?x=1", "payload"), peer(), false);
        ctx.state_bag.set("k", 1u32);

        let mut clone = ctx.clone_for_loopback();
        assert_eq!(clone.method, Method::POST);
        assert_eq!(clone.uri.path(), "/a/b");
        assert_eq!(clone.uri.query(), Some("x=1"));
        assert_eq!(clone.headers, ctx.headers);
        assert_eq!(clone.loop_counter, 1);
        assert!(clone.state_bag.get::<u32>("k").is_some());

        // The body moved over intact; the parent no longer holds one.
        assert!(ctx.body.is_none());
        let bytes = clone
            .body
            .take()
            .unwrap()
            .collect()
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(bytes.as_ref(), b"payload");
    }

    #[test]
    fn test_apply_route_outgoing_host() {
        use crate::routing::{Backend, Route};

        let route = Arc::new(Route::for_tests(
            "r1",
            Backend::Network {
                scheme: "http".into(),
                host: "backend.internal:8080".into(),
            },
        ));

        let mut ctx = RequestContext::new(test_request("/", ""), peer(), false);
        ctx.apply_route(route.clone(), Vec::new(), false);
        assert_eq!(ctx.outgoing_host, "backend.internal:8080");

        let mut preserved = RequestContext::new(test_request("/", ""), peer(), false);
        preserved.apply_route(route, Vec::new(), true);
        assert_eq!(preserved.outgoing_host, "proxy.test");
    }

    #[test]
    fn test_ensure_default_response() {
        let mut ctx = RequestContext::new(test_request("/", ""), peer(), false);
        ctx.shunt();
        assert!(ctx.is_shunted());
        ctx.ensure_default_response();
        assert_eq!(
            ctx.response.as_ref().unwrap().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_capture_at_exactly_limit_buffers() {
        let pool = BodyCapturePool::new(1024);
        let payload = vec![7u8; 16];
        let body = full_body(payload.clone());
        let mut captured = CapturedBody::capture(body, Some(16), 16, &pool)
            .await
            .unwrap();
        assert!(matches!(captured, CapturedBody::Buffered { .. }));

        // Replays are identical byte-for-byte, any number of times.
        for _ in 0..3 {
            let bytes = captured.replay().collect().await.unwrap().to_bytes();
            assert_eq!(bytes.as_ref(), payload.as_slice());
        }
    }

    #[tokio::test]
    async fn test_capture_above_limit_streams() {
        let pool = BodyCapturePool::new(1024);
        let body = full_body(vec![7u8; 32]);
        let captured = CapturedBody::capture(body, Some(32), 16, &pool)
            .await
            .unwrap();
        assert!(matches!(captured, CapturedBody::Streaming(_)));
    }

    #[tokio::test]
    async fn test_capture_pool_exhaustion_falls_back_to_streaming() {
        let pool = BodyCapturePool::new(8);
        let first = CapturedBody::capture(full_body(vec![1u8; 8]), Some(8), 64, &pool)
            .await
            .unwrap();
        assert!(matches!(first, CapturedBody::Buffered { .. }));

        let second = CapturedBody::capture(full_body(vec![2u8; 8]), Some(8), 64, &pool)
            .await
            .unwrap();
        assert!(matches!(second, CapturedBody::Streaming(_)));

        // Releasing the first capture frees budget again.
        drop(first);
        let third = CapturedBody::capture(full_body(vec![3u8; 8]), Some(8), 64, &pool)
            .await
            .unwrap();
        assert!(matches!(third, CapturedBody::Buffered { .. }));
    }
}
