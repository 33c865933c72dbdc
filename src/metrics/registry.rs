use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the admin endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix(".duration".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // Static-name metrics get HELP/TYPE lines. Route- and host-scoped
        // series use dynamic names and are self-describing.
        describe_gauge!("routes.total", Unit::Count, "Routes currently loaded");
        describe_gauge!(
            "routes.byte",
            Unit::Bytes,
            "Serialized size of the current route table"
        );
        describe_counter!(
            "routing.failures",
            Unit::Count,
            "Requests that matched no route"
        );
        describe_counter!(
            "passive-health-check.endpoints.dropped",
            Unit::Count,
            "Endpoints filtered out by passive health checking"
        );
        describe_counter!(
            "passive-health-check.requests.passed",
            Unit::Count,
            "Requests that went through passive health filtering with drops"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
