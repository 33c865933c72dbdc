use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Which failure signal trips the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerKind {
    /// Open after `failures` failures in a row.
    Consecutive,
    /// Open when the last `window` requests contain `failures` failures.
    Rate,
}

/// Breaker parameters supplied per route by filters. Equal settings against
/// the same host share one breaker instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub kind: BreakerKind,
    pub failures: u32,
    /// Sample window size; only meaningful for `Rate`.
    pub window: u32,
    /// How long the breaker stays open before probing.
    pub timeout: Duration,
    /// Successes required in half-open before closing again.
    pub half_open_requests: u32,
}

impl BreakerSettings {
    pub fn consecutive(failures: u32) -> Self {
        Self {
            kind: BreakerKind::Consecutive,
            failures,
            window: 0,
            timeout: Duration::from_secs(60),
            half_open_requests: 3,
        }
    }

    pub fn rate(failures: u32, window: u32) -> Self {
        Self {
            kind: BreakerKind::Rate,
            failures,
            window,
            timeout: Duration::from_secs(60),
            half_open_requests: 3,
        }
    }
}

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Per-(host, settings) granularity — each backend host gets its own breaker
/// so an unhealthy host is isolated without affecting the rest of the fleet.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<(String, BreakerSettings), Arc<Breaker>>,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask permission to hit `host`. `None` means the breaker is open and
    /// the request must fail fast; otherwise the returned ticket must be
    /// fed the outcome via [`BreakerTicket::done`].
    pub fn allow(&self, host: &str, settings: &BreakerSettings) -> Option<BreakerTicket> {
        let breaker = self.get_or_create(host, settings);
        if breaker.check() {
            Some(BreakerTicket { breaker })
        } else {
            None
        }
    }

    fn get_or_create(&self, host: &str, settings: &BreakerSettings) -> Arc<Breaker> {
        let key = (host.to_string(), settings.clone());
        if let Some(entry) = self.breakers.get(&key) {
            return entry.value().clone();
        }
        self.breakers
            .entry(key)
            .or_insert_with(|| Arc::new(Breaker::new(settings.clone())))
            .clone()
    }

    /// Drop breakers for hosts no longer routed to.
    pub fn retain_hosts(&self, active: &std::collections::HashSet<String>) {
        self.breakers.retain(|(host, _), _| active.contains(host));
    }
}

/// Outcome reporter handed out by a successful `allow()`.
pub struct BreakerTicket {
    breaker: Arc<Breaker>,
}

impl BreakerTicket {
    /// Report the request outcome. Status >= 500 and transport errors count
    /// as failure; everything else as success.
    pub fn done(self, success: bool) {
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }
}

struct Breaker {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    /// Outcome ring for the rate breaker; unused for consecutive.
    samples: Mutex<RateWindow>,
    settings: BreakerSettings,
}

struct RateWindow {
    outcomes: VecDeque<bool>,
    failures: u32,
}

impl Breaker {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            samples: Mutex::new(RateWindow {
                outcomes: VecDeque::new(),
                failures: 0,
            }),
            settings,
        }
    }

    fn check(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED | STATE_HALF_OPEN => true,
            STATE_OPEN => {
                let opened_at = self.opened_at.lock().expect("breaker lock poisoned");
                if let Some(at) = *opened_at {
                    if at.elapsed() >= self.settings.timeout {
                        drop(opened_at);
                        // CAS so only one caller wins the probe transition.
                        if self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.half_open_successes.store(0, Ordering::Relaxed);
                        }
                        return true;
                    }
                }
                false
            }
            _ => true,
        }
    }

    fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                if self.settings.kind == BreakerKind::Rate {
                    self.push_sample(true);
                }
            }
            STATE_HALF_OPEN => {
                let count = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.settings.half_open_requests {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.reset_samples();
                    tracing::info!(
                        "circuit_breaker: closed (recovered after {} successes)",
                        count
                    );
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let trip = match self.settings.kind {
                    BreakerKind::Consecutive => {
                        let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        count >= self.settings.failures
                    }
                    BreakerKind::Rate => self.push_sample(false),
                };
                if trip {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    *self.opened_at.lock().expect("breaker lock poisoned") = Some(Instant::now());
                    tracing::warn!("circuit_breaker: opened");
                }
            }
            STATE_HALF_OPEN => {
                // Probe failed.
                self.state.store(STATE_OPEN, Ordering::Release);
                *self.opened_at.lock().expect("breaker lock poisoned") = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::Relaxed);
                tracing::warn!("circuit_breaker: re-opened (probe failed in half-open)");
            }
            _ => {}
        }
    }

    /// Record one outcome in the sliding window. Returns `true` when the
    /// window is full and carries at least `failures` failures.
    fn push_sample(&self, success: bool) -> bool {
        let mut window = self.samples.lock().expect("breaker lock poisoned");
        window.outcomes.push_back(success);
        if !success {
            window.failures += 1;
        }
        while window.outcomes.len() > self.settings.window as usize {
            if let Some(evicted) = window.outcomes.pop_front() {
                if !evicted {
                    window.failures -= 1;
                }
            }
        }
        window.outcomes.len() == self.settings.window as usize
            && window.failures >= self.settings.failures
    }

    fn reset_samples(&self) {
        let mut window = self.samples.lock().expect("breaker lock poisoned");
        window.outcomes.clear();
        window.failures = 0;
    }
}
