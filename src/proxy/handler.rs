use crate::circuit::{BreakerSettings, BreakerTicket, CircuitBreakerRegistry};
use crate::config::{ProxyConfig, RatelimitSettings};
use crate::error::{ProxyError, ProxyErrorKind};
use crate::proxy::context::{
    empty_body, full_body, state_keys, AccessLogSetting, BoxBody, BodyCapturePool,
    RequestContext,
};
use crate::proxy::debug::debug_response;
use crate::proxy::filter::{
    apply_request_filters, apply_response_filters, ExecutorOptions,
};
use crate::proxy::stream::{StreamFinish, StreamingBody};
use crate::proxy::upgrade::{is_upgrade_request, serve_upgrade, UpgradeRequest};
use crate::ratelimit::RatelimitRegistry;
use crate::routing::{Backend, PriorityRoute, Route, RouteLookup, RouteTable};
use crate::scheduler::{LifoQueue, QueueError};
use crate::upstream::loadbalance::{select_endpoint, SelectionContext};
use crate::upstream::transport::build_http_client;
use crate::upstream::{EndpointRegistry, HttpClient};
use base64::Engine;
use futures_util::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, HOST, SERVER};
use http::{StatusCode, Uri};
use http_body_util::BodyExt;
use std::collections::HashSet;
use std::error::Error as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Value of the `Server` header stamped on responses that don't carry one.
const SERVER_BRAND: &str = "Skipper";

/// Hop-by-hop headers stripped before forwarding when the removal flag is
/// set.
const HOP_HEADERS: &[&str] = &[
    "te",
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Construction parameters: configuration plus the process-wide registries
/// the core is bound to. Registries are created explicitly at startup and
/// shared by reference, never implicit singletons.
pub struct ProxyParams {
    pub config: ProxyConfig,
    pub priority_routes: Vec<Box<dyn PriorityRoute>>,
    pub ratelimits: Arc<RatelimitRegistry>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub endpoints: Arc<EndpointRegistry>,
}

/// The request lifecycle engine: turns a matched route plus filter chain
/// into a served response.
pub struct Proxy {
    config: ProxyConfig,
    lookup: RouteLookup,
    client: HttpClient,
    ratelimits: Arc<RatelimitRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    endpoints: Arc<EndpointRegistry>,
    global_lifo: Option<Arc<LifoQueue>>,
    capture_pool: Arc<BodyCapturePool>,
    executor_options: ExecutorOptions,
    hostname: String,
}

impl Proxy {
    pub fn new(params: ProxyParams) -> Arc<Self> {
        let config = params.config;
        let client = build_http_client(&config.transport, config.flags.insecure);
        let global_lifo = config.global_lifo.clone().map(LifoQueue::new);
        let executor_options = ExecutorOptions {
            debug: config.flags.debug,
            log_filter_events: config.tracing.log_filter_events,
        };
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        let capture_pool = BodyCapturePool::new(config.body.max_memory_body_parsing);

        Arc::new(Self {
            config,
            lookup: RouteLookup::new(params.priority_routes),
            client,
            ratelimits: params.ratelimits,
            breakers: params.breakers,
            endpoints: params.endpoints,
            global_lifo,
            capture_pool,
            executor_options,
            hostname,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    pub fn capture_pool(&self) -> &Arc<BodyCapturePool> {
        &self.capture_pool
    }

    pub fn route_count(&self) -> usize {
        self.lookup.route_count()
    }

    /// Publish a new route table. Endpoint bookkeeping survives for
    /// endpoints still present; removed ones forget their detected time.
    /// Circuit breakers for hosts the new table no longer routes to are
    /// purged in the same pass.
    pub fn apply_routes(&self, routes: Vec<Route>) {
        let mut active: HashSet<String> = HashSet::new();
        let mut active_hosts: HashSet<String> = HashSet::new();
        for route in &routes {
            match &route.backend {
                Backend::LoadBalanced(group) => {
                    for endpoint in &group.endpoints {
                        self.endpoints.ensure(&endpoint.key);
                        active.insert(endpoint.key.clone());
                        active_hosts.insert(endpoint.host.clone());
                    }
                }
                Backend::Network { host, .. } => {
                    active_hosts.insert(host.clone());
                }
                _ => {}
            }
        }
        self.endpoints.retain(&active);
        // Breaker entries keyed by per-request hosts (preserve-host and
        // dynamic backends) are not in this set; they fall out at the next
        // reload and are recreated on demand, which bounds the map without
        // a separate sweep task.
        self.breakers.retain_hosts(&active_hosts);
        self.lookup.swap_table(RouteTable::build(routes));
    }

    /// Serve one request end to end. This is the handler the server wires
    /// into hyper; the request body arrives pre-boxed.
    pub async fn serve(
        self: &Arc<Self>,
        req: hyper::Request<BoxBody>,
        peer: SocketAddr,
    ) -> hyper::Response<BoxBody> {
        let mut ctx = RequestContext::new(req, peer, self.config.flags.preserve_original);
        metrics::counter!(format!("incoming.{}", ctx.proto())).increment(1);

        let span = tracing::info_span!(
            "ingress",
            otel.name = %self.config.tracing.initial_operation_name,
            span.kind = "server",
            component = "skipper",
            http.url = %ctx.uri,
            http.method = %ctx.method,
            hostname = %self.hostname,
            network.peer.address = %peer.ip(),
            http.path = %ctx.uri.path(),
            http.host = %ctx.incoming_host,
            flow_id = tracing::field::Empty,
            http.status_code = tracing::field::Empty,
            error = tracing::field::Empty,
            client.request = tracing::field::Empty,
        );
        if let Some(flow_id) = ctx.headers.get("x-flow-id").and_then(|v| v.to_str().ok()) {
            span.record("flow_id", flow_id);
        }

        let result = self.serve_gated(&mut ctx).instrument(span.clone()).await;
        self.finish_response(ctx, result, span)
    }

    /// Global gates, then the route pipeline.
    async fn serve_gated(self: &Arc<Self>, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        if let Some(settings) = &self.config.global_ratelimit {
            self.check_ratelimit(settings, ctx)?;
        }

        if let Some(queue) = &self.global_lifo {
            let permit = queue.wait().await.map_err(queue_error)?;
            ctx.lifo_permits.push(permit);
        }

        self.do_request(ctx).await
    }

    /// The route pipeline: lookup, request filters, dispatch, response
    /// filters. Loopback backends re-enter here with a cloned context.
    fn do_request<'a>(
        self: &'a Arc<Self>,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<(), ProxyError>> {
        Box::pin(async move {
            let max_loopbacks = self.config.effective_max_loopbacks();
            if max_loopbacks >= 0 && ctx.loop_counter > max_loopbacks {
                return Err(ProxyError::new(ProxyErrorKind::MaxLoopbacksReached, ""));
            }

            let (route, params) =
                match self
                    .lookup
                    .lookup(&ctx.method, ctx.uri.path(), &ctx.headers)
                {
                    Some(hit) => hit,
                    None => {
                        metrics::counter!("routing.failures").increment(1);
                        return Err(ProxyError::new(ProxyErrorKind::RouteLookupFailed, ""));
                    }
                };
            ctx.apply_route(route.clone(), params, self.config.flags.preserve_host);

            let filters_start = Instant::now();
            let invoked = if self.config.tracing.disable_filter_spans {
                apply_request_filters(&route.filters, ctx, &self.executor_options)
            } else {
                let span = tracing::info_span!("request_filters");
                span.in_scope(|| apply_request_filters(&route.filters, ctx, &self.executor_options))
            };
            metrics::histogram!(format!("allFilters.request.{}", route.id))
                .record(filters_start.elapsed().as_secs_f64());

            // Debug mode replaces dispatch entirely: no backend I/O.
            if self.config.flags.debug {
                let doc = debug_response(ctx, None).await;
                ctx.set_response(doc, false);
                return Ok(());
            }

            self.dispatch(&route, ctx).await?;

            if !ctx.handled {
                let filters_start = Instant::now();
                if self.config.tracing.disable_filter_spans {
                    apply_response_filters(&route.filters, invoked, ctx, &self.executor_options);
                } else {
                    let span = tracing::info_span!("response_filters");
                    span.in_scope(|| {
                        apply_response_filters(&route.filters, invoked, ctx, &self.executor_options)
                    });
                }
                metrics::histogram!(format!("allFilters.response.{}", route.id))
                    .record(filters_start.elapsed().as_secs_f64());
            }

            Ok(())
        })
    }

    /// Backend dispatch: shunt and loopback first, then the concurrency
    /// gates and the network round-trip.
    async fn dispatch(
        self: &Arc<Self>,
        route: &Arc<Route>,
        ctx: &mut RequestContext,
    ) -> Result<(), ProxyError> {
        // A filter may shunt any route kind.
        if ctx.is_shunted() {
            ctx.ensure_default_response();
            return Ok(());
        }

        match &route.backend {
            Backend::Shunt => {
                if ctx.response.is_none() {
                    ctx.set_response(
                        hyper::Response::builder()
                            .status(StatusCode::OK)
                            .body(empty_body())
                            .expect("static response"),
                        false,
                    );
                }
                ctx.shunt();
                Ok(())
            }
            Backend::Loopback => {
                let max_loopbacks = self.config.effective_max_loopbacks();
                if max_loopbacks < 0 {
                    return Err(ProxyError::new(
                        ProxyErrorKind::MaxLoopbacksReached,
                        "loopbacks disabled",
                    ));
                }
                let mut inner = ctx.clone_for_loopback();
                let result = self.do_request(&mut inner).await;
                ctx.debug_filter_panics = std::mem::take(&mut inner.debug_filter_panics);
                ctx.lifo_permits.extend(inner.lifo_permits.drain(..));
                ctx.stream_deadline = inner.stream_deadline;
                result?;
                ctx.response = inner.response.take();
                ctx.handled = inner.handled;
                Ok(())
            }
            Backend::Network { .. } | Backend::Dynamic | Backend::LoadBalanced(_) => {
                self.dispatch_network(route, ctx).await
            }
        }
    }

    async fn dispatch_network(
        self: &Arc<Self>,
        route: &Arc<Route>,
        ctx: &mut RequestContext,
    ) -> Result<(), ProxyError> {
        // Per-route rate limits attached by filters; first denial wins.
        if let Some(all) = ctx
            .state_bag
            .get::<Vec<RatelimitSettings>>(state_keys::ROUTE_RATELIMITS)
        {
            for settings in all.iter() {
                self.check_ratelimit(settings, ctx)?;
            }
        }

        // Per-route LIFO queues; slots are released after response
        // completion by the stream finish guard.
        if let Some(queues) = ctx
            .state_bag
            .get::<Vec<Arc<LifoQueue>>>(state_keys::LIFO_QUEUES)
        {
            for queue in queues.iter() {
                let permit = queue.wait().await.map_err(queue_error)?;
                ctx.lifo_permits.push(permit);
            }
        }

        let breaker_settings = ctx
            .state_bag
            .get::<BreakerSettings>(state_keys::BREAKER_SETTINGS);

        let backend_timeout = ctx
            .state_bag
            .get::<Duration>(state_keys::BACKEND_TIMEOUT)
            .map(|d| *d)
            .unwrap_or(self.config.transport.response_header_timeout);

        let retryable = matches!(route.backend, Backend::LoadBalanced(_)) && !ctx.has_body;
        let mut attempt = 0;
        loop {
            let (scheme, host) = self.resolve_target(route, ctx)?;

            let ticket = match breaker_settings.as_deref() {
                Some(settings) => match self.breakers.allow(&ctx.outgoing_host, settings) {
                    Some(ticket) => Some(ticket),
                    None => {
                        tracing::debug!(route = %route.id, "circuit_breaker=open");
                        return Err(ProxyError::new(
                            ProxyErrorKind::CircuitOpen,
                            ctx.outgoing_host.clone(),
                        )
                        .with_header(
                            HeaderName::from_static("x-circuit-open"),
                            HeaderValue::from_static("true"),
                        ));
                    }
                },
                None => None,
            };

            // Protocol upgrades bypass the normal response pipeline.
            if self.config.upgrade.experimental_upgrade
                && is_upgrade_request(ctx.version, &ctx.headers)
            {
                return self.dispatch_upgrade(&scheme, &host, ctx, ticket).await;
            }

            let endpoint_metrics = self.endpoints.get(&format!("{}://{}", scheme, host));
            let _inflight = endpoint_metrics.as_ref().map(|m| m.track_inflight());

            let roundtrip_start = Instant::now();
            let deadline = roundtrip_start + backend_timeout;
            let result = self
                .roundtrip(route, ctx, &scheme, &host, deadline)
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let failed = status.as_u16() >= 500;
                    if let Some(ticket) = ticket {
                        ticket.done(!failed);
                    }
                    if let Some(metrics) = endpoint_metrics.as_ref() {
                        metrics.record_request(failed);
                    }

                    let elapsed = roundtrip_start.elapsed().as_secs_f64();
                    metrics::histogram!(format!("backend.{}.duration", route.id)).record(elapsed);
                    metrics::histogram!(format!("backend.{}.duration", host)).record(elapsed);
                    if failed {
                        metrics::counter!(format!("backend.{}.5xx", route.id)).increment(1);
                    }

                    if ctx
                        .state_bag
                        .get::<Duration>(state_keys::BACKEND_TIMEOUT)
                        .is_some()
                    {
                        ctx.stream_deadline = Some(deadline);
                    }
                    ctx.set_response(resp, self.config.flags.preserve_original);
                    return Ok(());
                }
                Err(err) => {
                    if let Some(ticket) = ticket {
                        ticket.done(false);
                    }
                    if let Some(metrics) = endpoint_metrics.as_ref() {
                        metrics.record_request(true);
                    }

                    if err.is_dialing_failure() && retryable && attempt == 0 {
                        // One retry against a freshly selected endpoint.
                        // The failed attempt's proxy span is already closed.
                        tracing::info!(retry = %route.id, "retrying on dial failure");
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn dispatch_upgrade(
        self: &Arc<Self>,
        scheme: &str,
        host: &str,
        ctx: &mut RequestContext,
        ticket: Option<BreakerTicket>,
    ) -> Result<(), ProxyError> {
        let on_upgrade = ctx.on_upgrade.take().ok_or_else(|| {
            ProxyError::new(
                ProxyErrorKind::BackendTransport,
                "request is not upgradable",
            )
        })?;

        let mut headers = ctx.headers.clone();
        set_host_header(&mut headers, &ctx.outgoing_host);

        let req = UpgradeRequest {
            method: ctx.method.clone(),
            path_and_query: ctx
                .uri
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| "/".to_string()),
            headers,
            body: ctx.body.take().unwrap_or_else(empty_body),
            on_upgrade,
        };

        let result = serve_upgrade(
            scheme,
            host,
            req,
            self.config.flags.insecure,
            self.config.upgrade.experimental_upgrade_audit,
        )
        .await;

        match result {
            Ok(resp) => {
                if let Some(ticket) = ticket {
                    ticket.done(resp.status().as_u16() < 500);
                }
                // A switched protocol takes the response pipeline out of
                // the loop; anything else proxies back normally.
                ctx.handled = resp.status() == StatusCode::SWITCHING_PROTOCOLS;
                ctx.set_response(resp, false);
                Ok(())
            }
            Err(err) => {
                if let Some(ticket) = ticket {
                    ticket.done(false);
                }
                Err(err)
            }
        }
    }

    /// One backend round-trip inside its proxy span.
    async fn roundtrip(
        self: &Arc<Self>,
        route: &Arc<Route>,
        ctx: &mut RequestContext,
        scheme: &str,
        host: &str,
        deadline: Instant,
    ) -> Result<hyper::Response<BoxBody>, ProxyError> {
        let span_name = ctx
            .state_bag
            .get::<String>(state_keys::PROXY_SPAN_NAME)
            .map(|n| (*n).clone())
            .unwrap_or_else(|| "proxy".to_string());
        let span = tracing::info_span!(
            "proxy",
            otel.name = %span_name,
            span.kind = "client",
            skipper.route_id = %route.id,
            skipper.route = %route.describe(),
            http.status_code = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        let outgoing = self.build_backend_request(ctx, scheme, host)?;
        metrics::counter!("outgoing.HTTP/1.1").increment(1);

        let send = async {
            tracing::trace!("http_roundtrip start");
            let result = tokio::time::timeout_at(
                deadline.into(),
                self.client.request(outgoing),
            )
            .await;
            tracing::trace!("http_roundtrip end");
            result
        };

        match send.instrument(span.clone()).await {
            Ok(Ok(resp)) => {
                span.record("http.status_code", u64::from(resp.status().as_u16()));
                Ok(resp.map(|b| b.map_err(|e| e.into()).boxed()))
            }
            Ok(Err(e)) => {
                span.record("error", true);
                Err(classify_client_error(e, route, host))
            }
            Err(_) => {
                span.record("error", true);
                tracing::debug!(route = %route.id, backend = %host, "backend timeout");
                Err(ProxyError::new(
                    ProxyErrorKind::BackendTimeout,
                    format!("{} did not respond in time", host),
                ))
            }
        }
    }

    /// Copy the request head onto an outgoing request for `scheme://host`.
    fn build_backend_request(
        &self,
        ctx: &mut RequestContext,
        scheme: &str,
        host: &str,
    ) -> Result<hyper::Request<BoxBody>, ProxyError> {
        // Synthesize basic credentials when the target carries user-info.
        let (credentials, host) = match host.split_once('@') {
            Some((userinfo, real_host)) => (Some(userinfo.to_string()), real_host),
            None => (None, host),
        };

        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("{}://{}{}", scheme, host, path_and_query)
            .parse()
            .map_err(|e| {
                ProxyError::new(ProxyErrorKind::Internal, format!("target url: {}", e))
            })?;

        let mut headers = ctx.headers.clone();
        if self.config.flags.hop_headers_removal {
            for name in HOP_HEADERS {
                headers.remove(*name);
            }
        }
        set_host_header(&mut headers, &ctx.outgoing_host);
        if let Some(userinfo) = credentials {
            let encoded = base64::engine::general_purpose::STANDARD.encode(userinfo);
            if let Ok(value) = HeaderValue::from_str(&format!("Basic {}", encoded)) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        let mut builder = hyper::Request::builder().method(ctx.method.clone()).uri(uri);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        builder
            .body(ctx.body.take().unwrap_or_else(empty_body))
            .map_err(|e| ProxyError::new(ProxyErrorKind::Internal, format!("build request: {}", e)))
    }

    /// Scheme and host of the dispatch target for this attempt.
    fn resolve_target(
        &self,
        route: &Arc<Route>,
        ctx: &mut RequestContext,
    ) -> Result<(String, String), ProxyError> {
        match &route.backend {
            Backend::Network { scheme, host } => Ok((scheme.clone(), host.clone())),
            Backend::Dynamic => Ok(self.resolve_dynamic(ctx)),
            Backend::LoadBalanced(group) => {
                let hash_key = ctx
                    .state_bag
                    .get::<String>(state_keys::CONSISTENT_HASH_KEY)
                    .map(|k| (*k).clone())
                    .unwrap_or_else(|| ctx.client_addr.ip().to_string());
                let selection = SelectionContext {
                    registry: self.endpoints.as_ref(),
                    hash_key: &hash_key,
                    passive_health: self
                        .config
                        .passive_health
                        .enabled
                        .then_some(&self.config.passive_health),
                    route_id: &route.id,
                };
                let endpoint = select_endpoint(group, &selection).ok_or_else(|| {
                    ProxyError::new(ProxyErrorKind::Internal, "no endpoints on route")
                })?;
                Ok((endpoint.scheme.clone(), endpoint.host.clone()))
            }
            _ => Err(ProxyError::new(
                ProxyErrorKind::Internal,
                "not a network backend",
            )),
        }
    }

    /// Dynamic backends read their target from the state bag: a full URL
    /// wins; otherwise host and scheme resolve independently, falling back
    /// to what the client sent.
    fn resolve_dynamic(&self, ctx: &RequestContext) -> (String, String) {
        if let Some(url) = ctx
            .state_bag
            .get::<String>(state_keys::DYNAMIC_BACKEND_URL)
        {
            if let Ok(uri) = url.parse::<Uri>() {
                if let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) {
                    return (scheme.to_string(), authority.to_string());
                }
            }
        }
        let scheme = ctx
            .state_bag
            .get::<String>(state_keys::DYNAMIC_BACKEND_SCHEME)
            .map(|s| (*s).clone())
            .unwrap_or_else(|| "http".to_string());
        let host = ctx
            .state_bag
            .get::<String>(state_keys::DYNAMIC_BACKEND_HOST)
            .map(|h| (*h).clone())
            .unwrap_or_else(|| ctx.incoming_host.clone());
        (scheme, host)
    }

    fn check_ratelimit(
        &self,
        settings: &RatelimitSettings,
        ctx: &RequestContext,
    ) -> Result<(), ProxyError> {
        let limiter = self.ratelimits.get(settings);
        let key = ctx.client_addr.ip().to_string();
        if limiter.allow(&key) {
            return Ok(());
        }
        let retry_after = limiter.retry_after(&key);
        Err(
            ProxyError::new(ProxyErrorKind::Ratelimited, format!("key {}", key))
                .with_header(
                    HeaderName::from_static("x-rate-limit"),
                    header_value_num(limiter.rate_per_hour()),
                )
                .with_header(
                    HeaderName::from_static("retry-after"),
                    header_value_num(retry_after),
                ),
        )
    }

    /// Map the pipeline outcome onto the final response, brand it, and
    /// attach the streaming instrumentation that logs and measures when
    /// the body completes.
    fn finish_response(
        self: &Arc<Self>,
        mut ctx: RequestContext,
        result: Result<(), ProxyError>,
        span: tracing::Span,
    ) -> hyper::Response<BoxBody> {
        let mut response = match &result {
            Ok(()) => {
                ctx.ensure_default_response();
                ctx.response.take().expect("response ensured")
            }
            Err(err) => {
                if err.log_as_error() {
                    tracing::error!(
                        route = %ctx.route_id(),
                        backend = %ctx.outgoing_host,
                        status = err.status(self.default_status()).as_u16(),
                        "error while proxying: {}",
                        err
                    );
                } else {
                    tracing::info!(route = %ctx.route_id(), "{}", err);
                }
                span.record("error", true);
                self.error_response(err)
            }
        };

        if !ctx.handled && !response.headers().contains_key(SERVER) {
            response
                .headers_mut()
                .insert(SERVER, HeaderValue::from_static(SERVER_BRAND));
        }

        let access_log = ctx
            .state_bag
            .get::<AccessLogSetting>(state_keys::ACCESS_LOG)
            .map(|s| (*s).clone());
        let finish = StreamFinish {
            route_id: ctx.route_id().to_string(),
            method: ctx.method.to_string(),
            host: ctx.incoming_host.clone(),
            path: ctx.raw_path.clone(),
            status: response.status().as_u16(),
            client_addr: ctx.client_addr,
            start: ctx.start,
            access_log,
            access_log_disabled: self.config.access_log.disabled,
            span,
            lifo_permits: std::mem::take(&mut ctx.lifo_permits),
        };

        if ctx.handled {
            // Upgrade tunnels own the connection from here; hyper never
            // polls the 101 body, so the finish actions run right away.
            finish.complete_now();
            return response;
        }

        StreamingBody::wrap(
            response,
            finish,
            ctx.stream_deadline,
            self.config.tracing.log_stream_events,
        )
    }

    fn error_response(&self, err: &ProxyError) -> hyper::Response<BoxBody> {
        let status = err.status(self.default_status());
        let mut builder = hyper::Response::builder().status(status);
        for (name, value) in &err.additional_headers {
            builder = builder.header(name, value);
        }
        let body = if matches!(err.kind, ProxyErrorKind::RouteLookupFailed) {
            String::new()
        } else {
            err.to_string()
        };
        builder
            .body(full_body(body))
            .unwrap_or_else(|_| hyper::Response::new(empty_body()))
    }

    fn default_status(&self) -> StatusCode {
        StatusCode::from_u16(self.config.default_http_status).unwrap_or(StatusCode::NOT_FOUND)
    }
}

fn set_host_header(headers: &mut http::HeaderMap, outgoing_host: &str) {
    if outgoing_host.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(outgoing_host) {
        headers.insert(HOST, value);
    }
}

fn header_value_num(n: u64) -> HeaderValue {
    let mut buf = itoa::Buffer::new();
    HeaderValue::from_str(buf.format(n)).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn queue_error(e: QueueError) -> ProxyError {
    match e {
        QueueError::Full => ProxyError::new(ProxyErrorKind::QueueFull, "lifo queue"),
        QueueError::Timeout => ProxyError::new(ProxyErrorKind::QueueTimeout, "lifo queue"),
    }
}

/// Classify a hyper client failure into the error taxonomy.
fn classify_client_error(
    e: hyper_util::client::legacy::Error,
    route: &Arc<Route>,
    host: &str,
) -> ProxyError {
    if e.is_connect() {
        tracing::debug!(route = %route.id, backend = %host, "connect failed: {}", e);
        return ProxyError::new(ProxyErrorKind::DialingFailed, e.to_string());
    }

    // A malformed or aborted incoming body surfaces while hyper replays it
    // to the backend; map it to the client's fault, not the backend's.
    let mut source: Option<&(dyn std::error::Error + 'static)> = e.source();
    while let Some(cause) = source {
        if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
            if hyper_err.is_parse() || hyper_err.is_body_write_aborted() {
                tracing::error!(
                    "failed to do backend roundtrip due to invalid request: {}",
                    hyper_err
                );
                return ProxyError::new(ProxyErrorKind::InvalidRequestBody, hyper_err.to_string());
            }
        }
        source = cause.source();
    }

    tracing::debug!(route = %route.id, backend = %host, "roundtrip failed: {}", e);
    ProxyError::new(ProxyErrorKind::BackendTransport, e.to_string())
}
