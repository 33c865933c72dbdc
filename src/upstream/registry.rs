use crate::config::PassiveHealthConfig;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Fail ratios above this are treated as total failure when scaling the
/// drop probability.
const MAX_FAIL_RATIO: f64 = 0.9;

/// Process-wide endpoint bookkeeping, one entry per unique `scheme://host`.
///
/// Counters are bumped by the dispatcher on every load-balanced request and
/// periodically folded into a drop probability by the passive health
/// updater. The detected time survives route table reloads; an endpoint has
/// to disappear from the table before its age resets.
pub struct EndpointRegistry {
    endpoints: DashMap<String, Arc<EndpointMetrics>>,
}

pub struct EndpointMetrics {
    detected_at: Mutex<Instant>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    inflight: AtomicUsize,
    /// f64 bits; read by the load balancer, written by the updater task.
    drop_probability: AtomicU64,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self {
            endpoints: DashMap::new(),
        }
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the metrics entry for `key` (`scheme://host`).
    /// First sighting records the detected time.
    pub fn ensure(&self, key: &str) -> Arc<EndpointMetrics> {
        if let Some(entry) = self.endpoints.get(key) {
            return entry.value().clone();
        }
        self.endpoints
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(EndpointMetrics::new(Instant::now())))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<EndpointMetrics>> {
        self.endpoints.get(key).map(|e| e.value().clone())
    }

    /// Apply an external created-time hint. Only moves the detected time
    /// backwards; a hint younger than what we observed is ignored.
    pub fn hint_detected(&self, key: &str, created: Instant) {
        let metrics = self.ensure(key);
        let mut detected = metrics.detected_at.lock().expect("registry lock poisoned");
        if created < *detected {
            *detected = created;
        }
    }

    /// Drop endpoints absent from the active set. A later re-add starts a
    /// fresh entry, which restarts the fade-in age.
    pub fn retain(&self, active: &HashSet<String>) {
        self.endpoints.retain(|key, _| active.contains(key));
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// One pass of the passive health computation. Separated from the task
    /// loop so tests can drive it directly.
    pub fn update_health(&self, config: &PassiveHealthConfig) {
        for entry in self.endpoints.iter() {
            let metrics = entry.value();
            let total = metrics.total_requests.swap(0, Ordering::Relaxed);
            let failed = metrics.failed_requests.swap(0, Ordering::Relaxed);

            if total < config.min_requests {
                metrics.set_drop_probability(0.0);
                continue;
            }

            let fail_ratio = (failed as f64 / total as f64).min(MAX_FAIL_RATIO);
            let scaled = config.min_drop_probability
                + (config.max_drop_probability - config.min_drop_probability)
                    * (fail_ratio / MAX_FAIL_RATIO);
            metrics.set_drop_probability(scaled.min(config.max_drop_probability));
        }
    }
}

impl EndpointMetrics {
    fn new(detected_at: Instant) -> Self {
        Self {
            detected_at: Mutex::new(detected_at),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            inflight: AtomicUsize::new(0),
            drop_probability: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn record_request(&self, failed: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// RAII in-flight marker used by the power-of-choices and
    /// balance-factor algorithms.
    pub fn track_inflight(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            metrics: self.clone(),
        }
    }

    pub fn drop_probability(&self) -> f64 {
        f64::from_bits(self.drop_probability.load(Ordering::Relaxed))
    }

    fn set_drop_probability(&self, p: f64) {
        self.drop_probability.store(p.to_bits(), Ordering::Relaxed);
    }

    pub fn age(&self, now: Instant) -> Duration {
        let detected = *self.detected_at.lock().expect("registry lock poisoned");
        now.saturating_duration_since(detected)
    }

    /// Fade-in weight of this endpoint: 1.0 once older than `duration`,
    /// otherwise `(age/duration)^exponent`.
    pub fn fade_in_weight(&self, duration: Duration, exponent: f64, now: Instant) -> f64 {
        fade_in_weight(self.age(now), duration, exponent)
    }
}

pub struct InflightGuard {
    metrics: Arc<EndpointMetrics>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.metrics.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The fade-in curve. `duration <= 0` or `age >= duration` mean full weight.
pub fn fade_in_weight(age: Duration, duration: Duration, exponent: f64) -> f64 {
    if duration.is_zero() || age >= duration {
        return 1.0;
    }
    (age.as_secs_f64() / duration.as_secs_f64()).powf(exponent)
}

/// Spawn the single-writer passive health task: every `stats_reset_period`
/// it folds the observed failure ratios into drop probabilities and resets
/// the counters.
pub fn start_passive_health_updater(
    registry: Arc<EndpointRegistry>,
    config: PassiveHealthConfig,
    shutdown: Arc<tokio::sync::Notify>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(config.stats_reset_period) => {}
                _ = shutdown.notified() => return,
            }
            registry.update_health(&config);
            tracing::debug!("passive_health: updated {} endpoints", registry.len());
        }
    });
}
