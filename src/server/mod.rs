pub mod bootstrap;

use crate::metrics::Metrics;
use crate::proxy::context::{full_body, BoxBody};
use crate::proxy::Proxy;
use crate::routing::RouteSource;
use anyhow::Result;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Run the main proxy listener with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight connections to complete
/// before returning.
pub async fn run_proxy_server(
    listen: &str,
    proxy: Arc<Proxy>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    run_proxy_listener(listener, proxy, shutdown).await
}

/// Serve on an already-bound listener. Split out so callers (and tests)
/// can bind port 0 and read the assigned address first.
pub async fn run_proxy_listener(
    listener: TcpListener,
    proxy: Arc<Proxy>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    info!(
        "server: proxy listening, addr={}",
        listener.local_addr()?
    );

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: accept failed, error={}", e);
                continue;
            }
        };

        active_conns.fetch_add(1, Ordering::Relaxed);
        let proxy = proxy.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let proxy_inner = proxy.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let proxy = proxy_inner.clone();
                async move {
                    let req = req.map(|b| b.map_err(Into::into).boxed());
                    Ok::<_, Infallible>(proxy.serve(req, peer_addr).await)
                }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: connection error, peer={}, error={}", peer_addr, e);
                }
            }

            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for in-flight connections (or the timeout).
    let drain = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(_) => info!("server: all connections drained"),
        Err(_) => info!(
            "server: drain timeout, {} connections still active",
            active_conns.load(Ordering::Relaxed)
        ),
    }

    Ok(())
}

/// Run the admin listener: liveness, Prometheus exposition, and route
/// table reloads from the configured source.
pub async fn run_admin_server(
    listen: &str,
    proxy: Arc<Proxy>,
    metrics: Metrics,
    route_source: Arc<dyn RouteSource>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let proxy = proxy.clone();
        let metrics = metrics.clone();
        let route_source = route_source.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let proxy = proxy.clone();
                let metrics = metrics.clone();
                let route_source = route_source.clone();
                async move { handle_admin(req, &proxy, &metrics, route_source.as_ref()) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin connection error, error={}", e);
                }
            }
        });
    }
}

fn handle_admin(
    req: Request<Incoming>,
    proxy: &Arc<Proxy>,
    metrics: &Metrics,
    route_source: &dyn RouteSource,
) -> Result<hyper::Response<BoxBody>, Infallible> {
    let response = match (req.method().as_str(), req.uri().path()) {
        ("GET", "/healthz") => text_response(StatusCode::OK, "ok"),
        ("GET", "/metrics") => text_response(StatusCode::OK, metrics.render()),
        ("POST", "/routes/reload") => match route_source.load() {
            Ok(routes) => {
                let count = routes.len();
                proxy.apply_routes(routes);
                text_response(StatusCode::OK, format!("reloaded {} routes", count))
            }
            Err(e) => {
                error!("admin: route reload failed: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        },
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn text_response(status: StatusCode, body: impl Into<String>) -> hyper::Response<BoxBody> {
    hyper::Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(body.into()))
        .expect("static response")
}
