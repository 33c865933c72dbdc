//! Filters that couple to the core through the state bag: traffic gates
//! (rate limits, breakers, queues), dispatch hints (dynamic backend,
//! timeouts, hash keys) and access-log control, plus the small header/path
//! mutators the integration scenarios are built from.

use super::{Filter, FilterRegistry};
use crate::circuit::BreakerSettings;
use crate::config::RatelimitSettings;
use crate::proxy::context::{
    full_body, state_keys, AccessLogSetting, RequestContext,
};
use crate::scheduler::LifoQueue;
use anyhow::{anyhow, bail, Context, Result};
use http::header::{HeaderName, HeaderValue};
use http::{StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;

pub fn register(registry: &mut FilterRegistry) {
    registry.register("setPath", |args| {
        let path = one_arg("setPath", args)?;
        Ok(Arc::new(SetPath { path }))
    });
    registry.register("setRequestHeader", |args| {
        let (name, value) = header_args("setRequestHeader", args)?;
        Ok(Arc::new(SetRequestHeader { name, value }))
    });
    registry.register("setResponseHeader", |args| {
        let (name, value) = header_args("setResponseHeader", args)?;
        Ok(Arc::new(SetResponseHeader { name, value }))
    });
    registry.register("status", |args| {
        let code: u16 = one_arg("status", args)?.parse().context("status code")?;
        let status = StatusCode::from_u16(code).context("status code")?;
        Ok(Arc::new(Status { status }))
    });
    registry.register("inlineContent", |args| {
        let content = one_arg("inlineContent", args)?;
        Ok(Arc::new(InlineContent { content }))
    });
    registry.register("backendTimeout", |args| {
        let timeout = duration_arg("backendTimeout", args, 0)?;
        Ok(Arc::new(BackendTimeout { timeout }))
    });
    registry.register("consecutiveBreaker", |args| {
        if args.is_empty() {
            bail!("consecutiveBreaker: missing failure count");
        }
        let mut settings =
            BreakerSettings::consecutive(args[0].parse().context("failure count")?);
        if let Some(timeout) = args.get(1) {
            settings.timeout = parse_duration(timeout)?;
        }
        if let Some(half_open) = args.get(2) {
            settings.half_open_requests = half_open.parse().context("half-open requests")?;
        }
        Ok(Arc::new(Breaker { settings }))
    });
    registry.register("rateBreaker", |args| {
        if args.len() < 2 {
            bail!("rateBreaker: need failures and window");
        }
        let mut settings = BreakerSettings::rate(
            args[0].parse().context("failure count")?,
            args[1].parse().context("window size")?,
        );
        if let Some(timeout) = args.get(2) {
            settings.timeout = parse_duration(timeout)?;
        }
        Ok(Arc::new(Breaker { settings }))
    });
    registry.register("serviceRatelimit", |args| {
        if args.len() < 2 {
            bail!("serviceRatelimit: need max hits and time window");
        }
        let settings = RatelimitSettings {
            max_hits: args[0].parse().context("max hits")?,
            time_window: parse_duration(&args[1])?,
        };
        Ok(Arc::new(Ratelimit { settings }))
    });
    registry.register("lifo", |args| {
        let mut settings = crate::config::LifoSettings::default();
        if let Some(v) = args.first() {
            settings.max_concurrency = v.parse().context("max concurrency")?;
        }
        if let Some(v) = args.get(1) {
            settings.max_queue_size = v.parse().context("max queue size")?;
        }
        if let Some(v) = args.get(2) {
            settings.timeout = parse_duration(v)?;
        }
        // One queue per filter instance, i.e. per route occurrence.
        Ok(Arc::new(Lifo {
            queue: LifoQueue::new(settings),
        }))
    });
    registry.register("consistentHashKey", |args| {
        let header = one_arg("consistentHashKey", args)?;
        Ok(Arc::new(ConsistentHashKey {
            header: HeaderName::try_from(header.as_str()).context("header name")?,
        }))
    });
    registry.register("enableAccessLog", |args| {
        Ok(Arc::new(AccessLog {
            setting: AccessLogSetting {
                enable: true,
                prefixes: parse_prefixes(args)?,
            },
        }))
    });
    registry.register("disableAccessLog", |args| {
        Ok(Arc::new(AccessLog {
            setting: AccessLogSetting {
                enable: false,
                prefixes: parse_prefixes(args)?,
            },
        }))
    });
    registry.register("setDynamicBackendUrl", |args| {
        let value = one_arg("setDynamicBackendUrl", args)?;
        Ok(Arc::new(DynamicBackend {
            key: state_keys::DYNAMIC_BACKEND_URL,
            value,
        }))
    });
    registry.register("setDynamicBackendHost", |args| {
        let value = one_arg("setDynamicBackendHost", args)?;
        Ok(Arc::new(DynamicBackend {
            key: state_keys::DYNAMIC_BACKEND_HOST,
            value,
        }))
    });
    registry.register("setDynamicBackendScheme", |args| {
        let value = one_arg("setDynamicBackendScheme", args)?;
        Ok(Arc::new(DynamicBackend {
            key: state_keys::DYNAMIC_BACKEND_SCHEME,
            value,
        }))
    });
    registry.register("setOutgoingHost", |args| {
        let host = one_arg("setOutgoingHost", args)?;
        Ok(Arc::new(SetOutgoingHost { host }))
    });
}

fn one_arg(name: &str, args: &[String]) -> Result<String> {
    match args {
        [value] => Ok(value.clone()),
        _ => Err(anyhow!("{}: expected exactly one argument", name)),
    }
}

fn header_args(name: &str, args: &[String]) -> Result<(HeaderName, HeaderValue)> {
    if args.len() != 2 {
        bail!("{}: expected name and value", name);
    }
    Ok((
        HeaderName::try_from(args[0].as_str()).context("header name")?,
        HeaderValue::try_from(args[1].as_str()).context("header value")?,
    ))
}

fn duration_arg(name: &str, args: &[String], index: usize) -> Result<Duration> {
    let raw = args
        .get(index)
        .ok_or_else(|| anyhow!("{}: missing duration argument", name))?;
    parse_duration(raw)
}

fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw).map_err(|e| anyhow!("bad duration {:?}: {}", raw, e))
}

fn parse_prefixes(args: &[String]) -> Result<Vec<u16>> {
    args.iter()
        .map(|a| a.parse::<u16>().context("status prefix"))
        .collect()
}

struct SetPath {
    path: String,
}

impl Filter for SetPath {
    fn name(&self) -> &str {
        "setPath"
    }

    fn request(&self, ctx: &mut RequestContext) {
        let path_and_query = match ctx.uri.query() {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        };
        let mut parts = ctx.uri.clone().into_parts();
        match path_and_query.parse() {
            Ok(pq) => {
                parts.path_and_query = Some(pq);
                if let Ok(uri) = Uri::from_parts(parts) {
                    ctx.uri = uri;
                }
            }
            Err(_) => tracing::warn!("setPath: invalid path {:?}", self.path),
        }
    }
}

struct SetRequestHeader {
    name: HeaderName,
    value: HeaderValue,
}

impl Filter for SetRequestHeader {
    fn name(&self) -> &str {
        "setRequestHeader"
    }

    fn request(&self, ctx: &mut RequestContext) {
        ctx.headers.insert(self.name.clone(), self.value.clone());
    }
}

struct SetResponseHeader {
    name: HeaderName,
    value: HeaderValue,
}

impl Filter for SetResponseHeader {
    fn name(&self) -> &str {
        "setResponseHeader"
    }

    fn response(&self, ctx: &mut RequestContext) {
        if let Some(resp) = ctx.response.as_mut() {
            resp.headers_mut()
                .insert(self.name.clone(), self.value.clone());
        }
    }
}

struct Status {
    status: StatusCode,
}

impl Filter for Status {
    fn name(&self) -> &str {
        "status"
    }

    fn response(&self, ctx: &mut RequestContext) {
        if let Some(resp) = ctx.response.as_mut() {
            *resp.status_mut() = self.status;
        }
    }
}

/// Serves fixed content from the proxy itself; shunts the request.
struct InlineContent {
    content: String,
}

impl Filter for InlineContent {
    fn name(&self) -> &str {
        "inlineContent"
    }

    fn request(&self, ctx: &mut RequestContext) {
        let resp = hyper::Response::builder()
            .status(StatusCode::OK)
            .body(full_body(self.content.clone()))
            .expect("static response");
        ctx.set_response(resp, false);
        ctx.shunt();
    }
}

struct BackendTimeout {
    timeout: Duration,
}

impl Filter for BackendTimeout {
    fn name(&self) -> &str {
        "backendTimeout"
    }

    fn request(&self, ctx: &mut RequestContext) {
        ctx.state_bag.set(state_keys::BACKEND_TIMEOUT, self.timeout);
    }
}

struct Breaker {
    settings: BreakerSettings,
}

impl Filter for Breaker {
    fn name(&self) -> &str {
        "circuitBreaker"
    }

    fn request(&self, ctx: &mut RequestContext) {
        ctx.state_bag
            .set(state_keys::BREAKER_SETTINGS, self.settings.clone());
    }
}

struct Ratelimit {
    settings: RatelimitSettings,
}

impl Filter for Ratelimit {
    fn request(&self, ctx: &mut RequestContext) {
        // Several ratelimit filters may stack on one route; collect them
        // all, first denial wins in the dispatcher.
        let mut all: Vec<RatelimitSettings> = ctx
            .state_bag
            .get::<Vec<RatelimitSettings>>(state_keys::ROUTE_RATELIMITS)
            .map(|v| (*v).clone())
            .unwrap_or_default();
        all.push(self.settings.clone());
        ctx.state_bag.set(state_keys::ROUTE_RATELIMITS, all);
    }

    fn name(&self) -> &str {
        "serviceRatelimit"
    }
}

struct Lifo {
    queue: Arc<LifoQueue>,
}

impl Filter for Lifo {
    fn name(&self) -> &str {
        "lifo"
    }

    fn request(&self, ctx: &mut RequestContext) {
        let mut queues: Vec<Arc<LifoQueue>> = ctx
            .state_bag
            .get::<Vec<Arc<LifoQueue>>>(state_keys::LIFO_QUEUES)
            .map(|v| (*v).clone())
            .unwrap_or_default();
        queues.push(self.queue.clone());
        ctx.state_bag.set(state_keys::LIFO_QUEUES, queues);
    }
}

struct ConsistentHashKey {
    header: HeaderName,
}

impl Filter for ConsistentHashKey {
    fn name(&self) -> &str {
        "consistentHashKey"
    }

    fn request(&self, ctx: &mut RequestContext) {
        if let Some(value) = ctx.headers.get(&self.header).and_then(|v| v.to_str().ok()) {
            ctx.state_bag
                .set(state_keys::CONSISTENT_HASH_KEY, value.to_string());
        }
    }
}

struct AccessLog {
    setting: AccessLogSetting,
}

impl Filter for AccessLog {
    fn name(&self) -> &str {
        if self.setting.enable {
            "enableAccessLog"
        } else {
            "disableAccessLog"
        }
    }

    fn request(&self, ctx: &mut RequestContext) {
        ctx.state_bag
            .set(state_keys::ACCESS_LOG, self.setting.clone());
    }
}

struct DynamicBackend {
    key: &'static str,
    value: String,
}

impl Filter for DynamicBackend {
    fn name(&self) -> &str {
        "setDynamicBackend"
    }

    fn request(&self, ctx: &mut RequestContext) {
        ctx.state_bag.set(self.key, self.value.clone());
    }
}

struct SetOutgoingHost {
    host: String,
}

impl Filter for SetOutgoingHost {
    fn name(&self) -> &str {
        "setOutgoingHost"
    }

    fn request(&self, ctx: &mut RequestContext) {
        ctx.outgoing_host = self.host.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterSpec;
    use crate::proxy::context::BoxBody;
    use std::net::SocketAddr;

    fn make(name: &str, args: &[&str]) -> Arc<dyn Filter> {
        let registry = FilterRegistry::with_builtins();
        registry
            .create(&FilterSpec {
                name: name.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            })
            .unwrap()
    }

    fn ctx_for(path: &str) -> RequestContext {
        let req = hyper::Request::builder()
            .uri(path)
            .header("host", "t")
            .header("x-session", "user-1")
            .body(full_body(""))
            .unwrap();
        let peer: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        RequestContext::new(req, peer, false)
    }

    fn response_of(ctx: &RequestContext) -> &hyper::Response<BoxBody> {
        ctx.response.as_ref().unwrap()
    }

    #[test]
    fn test_set_path_keeps_query() {
        let filter = make("setPath", &["/rewritten"]);
        let mut ctx = ctx_for("/orig?q=1");
        filter.request(&mut ctx);
        assert_eq!(ctx.uri.path(), "/rewritten");
        assert_eq!(ctx.uri.query(), Some("q=1"));
    }

    #[test]
    fn test_inline_content_shunts_with_body() {
        let filter = make("inlineContent", &["hello"]);
        let mut ctx = ctx_for("/");
        filter.request(&mut ctx);
        assert!(ctx.is_shunted());
        assert_eq!(response_of(&ctx).status(), StatusCode::OK);
    }

    #[test]
    fn test_status_overrides_response() {
        let inline = make("inlineContent", &["x"]);
        let status = make("status", &["418"]);
        let mut ctx = ctx_for("/");
        inline.request(&mut ctx);
        status.response(&mut ctx);
        assert_eq!(response_of(&ctx).status().as_u16(), 418);
    }

    #[test]
    fn test_breaker_filter_attaches_settings() {
        let filter = make("consecutiveBreaker", &["5", "30s", "2"]);
        let mut ctx = ctx_for("/");
        filter.request(&mut ctx);
        let settings = ctx
            .state_bag
            .get::<BreakerSettings>(state_keys::BREAKER_SETTINGS)
            .unwrap();
        assert_eq!(settings.failures, 5);
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.half_open_requests, 2);
    }

    #[test]
    fn test_ratelimit_filters_stack() {
        let a = make("serviceRatelimit", &["10", "1s"]);
        let b = make("serviceRatelimit", &["100", "1m"]);
        let mut ctx = ctx_for("/");
        a.request(&mut ctx);
        b.request(&mut ctx);
        let all = ctx
            .state_bag
            .get::<Vec<RatelimitSettings>>(state_keys::ROUTE_RATELIMITS)
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].max_hits, 10);
        assert_eq!(all[1].time_window, Duration::from_secs(60));
    }

    #[test]
    fn test_consistent_hash_key_from_header() {
        let filter = make("consistentHashKey", &["x-session"]);
        let mut ctx = ctx_for("/");
        filter.request(&mut ctx);
        let key = ctx
            .state_bag
            .get::<String>(state_keys::CONSISTENT_HASH_KEY)
            .unwrap();
        assert_eq!(key.as_str(), "user-1");
    }

    #[test]
    fn test_access_log_filters() {
        let disable = make("disableAccessLog", &["2", "301"]);
        let mut ctx = ctx_for("/");
        disable.request(&mut ctx);
        let setting = ctx
            .state_bag
            .get::<AccessLogSetting>(state_keys::ACCESS_LOG)
            .unwrap();
        assert!(!setting.enable);
        assert_eq!(setting.prefixes, vec![2, 301]);
    }

    #[test]
    fn test_bad_args_fail_construction() {
        let registry = FilterRegistry::with_builtins();
        for (name, args) in [
            ("setPath", vec![]),
            ("status", vec!["not-a-code".to_string()]),
            ("serviceRatelimit", vec!["10".to_string()]),
            ("backendTimeout", vec!["nonsense".to_string()]),
        ] {
            let spec = FilterSpec {
                name: name.to_string(),
                args,
            };
            assert!(registry.create(&spec).is_err(), "filter {}", name);
        }
    }
}
