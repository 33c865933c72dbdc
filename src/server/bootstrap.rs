use crate::circuit::CircuitBreakerRegistry;
use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::proxy::filter::FilterRegistry;
use crate::proxy::{Proxy, ProxyParams};
use crate::ratelimit::RatelimitRegistry;
use crate::routing::{FileRouteSource, RouteSource};
use crate::server;
use crate::upstream::{start_passive_health_updater, EndpointRegistry};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub routes_path: PathBuf,
}

/// Proxy lifecycle: init → load routes → start background tasks → serve →
/// shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = if args.config_path.exists() {
        ProxyConfig::load(&args.config_path)?
    } else {
        tracing::info!(
            "config: {} not found, using defaults",
            args.config_path.display()
        );
        ProxyConfig::default()
    };

    let metrics = Metrics::install();

    // Process-wide registries, created once and passed by reference.
    let ratelimits = Arc::new(RatelimitRegistry::new());
    let breakers = Arc::new(CircuitBreakerRegistry::new());
    let endpoints = Arc::new(EndpointRegistry::new());

    let proxy = Proxy::new(ProxyParams {
        config: config.clone(),
        priority_routes: Vec::new(),
        ratelimits: ratelimits.clone(),
        breakers: breakers.clone(),
        endpoints: endpoints.clone(),
    });

    // Synchronous initial route load — the table must be ready before
    // traffic is accepted.
    let filter_registry = Arc::new(FilterRegistry::with_builtins());
    let route_source: Arc<dyn RouteSource> = Arc::new(FileRouteSource::new(
        args.routes_path.clone(),
        filter_registry,
    ));
    proxy.apply_routes(route_source.load()?);
    tracing::info!("routing: initial route table loaded, count={}", proxy.route_count());

    let shutdown = Arc::new(Notify::new());
    if config.passive_health.enabled {
        start_passive_health_updater(
            endpoints.clone(),
            config.passive_health.clone(),
            shutdown.clone(),
        );
    }
    start_ratelimit_sweep(ratelimits, &shutdown);

    // Admin listener for health, metrics, and route reloads.
    {
        let proxy = proxy.clone();
        let metrics = metrics.clone();
        let route_source = route_source.clone();
        let admin_listen = config.admin_listen.clone();
        tokio::spawn(async move {
            if let Err(e) =
                server::run_admin_server(&admin_listen, proxy, metrics, route_source).await
            {
                tracing::error!("server: admin failed, error={}", e);
            }
        });
    }

    tracing::info!("server: starting proxy, listen={}", config.listen);
    let proxy_handle = tokio::spawn({
        let listen = config.listen.clone();
        let proxy = proxy.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, proxy, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }
    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer guard must outlive main; leak it deliberately.
    std::mem::forget(guard);
}

fn start_ratelimit_sweep(registry: Arc<RatelimitRegistry>, shutdown: &Arc<Notify>) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
                _ = shutdown.notified() => return,
            }
            registry.evict_stale();
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
