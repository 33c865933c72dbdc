use crate::config::RatelimitSettings;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Process-wide registry mapping limiter settings to shared limiter
/// instances. Routes (or the global gate) carrying equal settings share one
/// limiter and therefore one set of counters.
pub struct RatelimitRegistry {
    limiters: DashMap<RatelimitSettings, Arc<Limiter>>,
}

impl Default for RatelimitRegistry {
    fn default() -> Self {
        Self {
            limiters: DashMap::new(),
        }
    }
}

impl RatelimitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep every limiter's idle windows. Called from a background task.
    pub fn evict_stale(&self) {
        for entry in self.limiters.iter() {
            entry.value().evict_stale();
        }
    }

    pub fn get(&self, settings: &RatelimitSettings) -> Arc<Limiter> {
        if let Some(entry) = self.limiters.get(settings) {
            return entry.value().clone();
        }
        self.limiters
            .entry(settings.clone())
            .or_insert_with(|| Arc::new(Limiter::new(settings.clone())))
            .clone()
    }
}

/// Fixed-window counter: `max_hits` requests per `time_window`, tracked per
/// key (typically the client address or the route id).
pub struct Limiter {
    settings: RatelimitSettings,
    windows: DashMap<String, Arc<Mutex<Window>>>,
}

struct Window {
    start: Instant,
    hits: u64,
}

impl Limiter {
    fn new(settings: RatelimitSettings) -> Self {
        Self {
            settings,
            windows: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &RatelimitSettings {
        &self.settings
    }

    /// Returns `true` while the key stays within `max_hits` per window.
    pub fn allow(&self, key: &str) -> bool {
        let slot = if let Some(entry) = self.windows.get(key) {
            entry.value().clone()
        } else {
            self.windows
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Window {
                        start: Instant::now(),
                        hits: 0,
                    }))
                })
                .clone()
        };

        let mut window = slot.lock().expect("ratelimit lock poisoned");
        if window.start.elapsed() >= self.settings.time_window {
            window.start = Instant::now();
            window.hits = 0;
        }
        if window.hits < self.settings.max_hits {
            window.hits += 1;
            true
        } else {
            false
        }
    }

    /// Seconds the denied client should back off: the window length,
    /// never less than one second.
    pub fn retry_after(&self, _key: &str) -> u64 {
        self.settings.time_window.as_secs().max(1)
    }

    /// Value of the `X-Rate-Limit` header: the configured allowance
    /// extrapolated to requests per hour.
    pub fn rate_per_hour(&self) -> u64 {
        let window = self.settings.time_window.as_secs_f64();
        if window <= 0.0 {
            return self.settings.max_hits;
        }
        (self.settings.max_hits as f64 * 3600.0 / window) as u64
    }

    /// Drop per-key windows that have been idle for at least two window
    /// lengths. Called from a background sweep to bound memory under
    /// high-cardinality keys.
    pub fn evict_stale(&self) {
        let expiry = self.settings.time_window * 2;
        self.windows.retain(|_, slot| match slot.try_lock() {
            Ok(window) => window.start.elapsed() < expiry,
            Err(_) => true,
        });
    }
}
