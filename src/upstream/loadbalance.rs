use crate::config::PassiveHealthConfig;
use crate::upstream::registry::EndpointRegistry;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One load-balanced backend endpoint, as published on a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbEndpoint {
    pub scheme: String,
    /// `host[:port]`.
    pub host: String,
    /// Registry key, pre-computed `scheme://host`.
    pub key: String,
}

impl LbEndpoint {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        let scheme = scheme.into();
        let host = host.into();
        let key = format!("{}://{}", scheme, host);
        Self { scheme, host, key }
    }
}

/// The endpoint group of a load-balanced route: members, algorithm, and the
/// fade-in curve for freshly detected members.
pub struct LbGroup {
    pub endpoints: Vec<LbEndpoint>,
    pub algorithm: LbAlgorithm,
    pub fade_in_duration: Option<Duration>,
    pub fade_in_exponent: f64,
}

impl LbGroup {
    pub fn new(endpoints: Vec<LbEndpoint>, algorithm: LbAlgorithm) -> Self {
        Self {
            endpoints,
            algorithm,
            fade_in_duration: None,
            fade_in_exponent: 1.0,
        }
    }
}

/// Endpoint selection algorithm. A closed set, so an enum rather than a
/// trait object; per-group selection state lives inside the variant.
pub enum LbAlgorithm {
    /// Atomic counter modulo member count.
    RoundRobin { counter: AtomicU64 },
    /// Uniform random member.
    Random,
    /// Rendezvous hashing on a request-derived key; with a balance factor,
    /// overloaded winners are skipped in hash order.
    ConsistentHash { balance_factor: Option<f64> },
    /// Sample `n` members uniformly, pick the one with fewest in-flight.
    PowerOfRandomNChoices { n: usize },
}

impl LbAlgorithm {
    /// Parse the route-file algorithm name. Unknown names fall back to
    /// round-robin, matching the route source contract.
    pub fn from_name(name: &str) -> Self {
        match name {
            "random" => Self::Random,
            "consistentHash" => Self::ConsistentHash {
                balance_factor: None,
            },
            "powerOfRandomNChoices" => Self::PowerOfRandomNChoices { n: 2 },
            _ => Self::RoundRobin {
                counter: AtomicU64::new(0),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin { .. } => "roundRobin",
            Self::Random => "random",
            Self::ConsistentHash { .. } => "consistentHash",
            Self::PowerOfRandomNChoices { .. } => "powerOfRandomNChoices",
        }
    }
}

/// Per-request inputs to endpoint selection.
pub struct SelectionContext<'a> {
    pub registry: &'a EndpointRegistry,
    /// Key for consistent hashing; defaults to the client host.
    pub hash_key: &'a str,
    /// Passive health filtering parameters, when enabled.
    pub passive_health: Option<&'a PassiveHealthConfig>,
    pub route_id: &'a str,
}

/// Select an endpoint from `group`: fade-in weighting, then passive-health
/// filtering, then the configured algorithm. Always returns a member of
/// `group.endpoints` when the group is non-empty.
pub fn select_endpoint<'a>(
    group: &'a LbGroup,
    ctx: &SelectionContext<'_>,
) -> Option<&'a LbEndpoint> {
    if group.endpoints.is_empty() {
        return None;
    }

    let candidates: Vec<&LbEndpoint> = group.endpoints.iter().collect();
    let candidates = apply_fade_in(group, ctx.registry, candidates);
    let candidates = apply_passive_health(ctx, candidates);

    Some(match &group.algorithm {
        LbAlgorithm::RoundRobin { counter } => {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            candidates[(n % candidates.len() as u64) as usize]
        }
        LbAlgorithm::Random => {
            let idx = rand::thread_rng().gen_range(0..candidates.len());
            candidates[idx]
        }
        LbAlgorithm::ConsistentHash { balance_factor } => {
            pick_rendezvous(&candidates, ctx, *balance_factor)
        }
        LbAlgorithm::PowerOfRandomNChoices { n } => pick_power_of_choices(&candidates, ctx, *n),
    })
}

/// Keep endpoints whose fade-in weight beats one shared uniform draw. A
/// fully faded endpoint (weight 1.0) always survives; an empty result keeps
/// everything so fading can never starve a route.
fn apply_fade_in<'a>(
    group: &LbGroup,
    registry: &EndpointRegistry,
    input: Vec<&'a LbEndpoint>,
) -> Vec<&'a LbEndpoint> {
    let duration = match group.fade_in_duration {
        Some(d) if !d.is_zero() => d,
        _ => return input,
    };

    let now = Instant::now();
    let threshold: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let kept: Vec<&LbEndpoint> = input
        .iter()
        .copied()
        .filter(|endpoint| {
            let weight = registry
                .ensure(&endpoint.key)
                .fade_in_weight(duration, group.fade_in_exponent, now);
            weight > threshold
        })
        .collect();

    if kept.is_empty() {
        input
    } else {
        kept
    }
}

/// Drop endpoints whose health-check drop probability beats one shared
/// uniform draw. The filter bails out (returning the unfiltered input) when
/// it would drop more than `max_unhealthy_endpoints_ratio` of the group, and
/// never returns an empty set.
fn apply_passive_health<'a>(
    ctx: &SelectionContext<'_>,
    input: Vec<&'a LbEndpoint>,
) -> Vec<&'a LbEndpoint> {
    let config = match ctx.passive_health {
        Some(c) if c.enabled => c,
        _ => return input,
    };

    let ratio = config.max_unhealthy_endpoints_ratio.clamp(0.0, 1.0);
    let max_dropped = (input.len() as f64 * ratio) as usize;
    let p: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let mut kept = Vec::with_capacity(input.len());
    let mut dropped = 0usize;
    let mut over_budget = false;

    for endpoint in input.iter() {
        let drop_probability = ctx
            .registry
            .get(&endpoint.key)
            .map(|m| m.drop_probability())
            .unwrap_or(0.0);
        if drop_probability > p {
            dropped += 1;
            metrics::counter!("passive-health-check.endpoints.dropped").increment(1);
            if dropped > max_dropped {
                over_budget = true;
                break;
            }
        } else {
            kept.push(*endpoint);
        }
    }

    // Too much of the group looks unhealthy for the filter to be
    // trustworthy, or everything dropped: serve from the full set.
    if over_budget || kept.is_empty() {
        return input;
    }
    if dropped > 0 {
        metrics::counter!("passive-health-check.requests.passed").increment(1);
    }
    kept
}

fn rendezvous_score(key: &str, endpoint: &LbEndpoint) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    endpoint.key.hash(&mut hasher);
    hasher.finish()
}

fn pick_rendezvous<'a>(
    candidates: &[&'a LbEndpoint],
    ctx: &SelectionContext<'_>,
    balance_factor: Option<f64>,
) -> &'a LbEndpoint {
    let mut order: Vec<&LbEndpoint> = candidates.to_vec();
    order.sort_by_key(|e| std::cmp::Reverse(rendezvous_score(ctx.hash_key, e)));

    let factor = match balance_factor {
        Some(f) if f > 0.0 => f,
        _ => return order[0],
    };

    // Skip hash winners that carry disproportionate in-flight load.
    let total: usize = order
        .iter()
        .map(|e| {
            ctx.registry
                .get(&e.key)
                .map(|m| m.inflight())
                .unwrap_or(0)
        })
        .sum();
    let average = (total as f64 + 1.0) / order.len() as f64;

    for endpoint in order.iter().copied() {
        let inflight = ctx
            .registry
            .get(&endpoint.key)
            .map(|m| m.inflight())
            .unwrap_or(0);
        if (inflight as f64) <= factor * average {
            return endpoint;
        }
    }
    order[order.len() - 1]
}

fn pick_power_of_choices<'a>(
    candidates: &[&'a LbEndpoint],
    ctx: &SelectionContext<'_>,
    n: usize,
) -> &'a LbEndpoint {
    let mut rng = rand::thread_rng();
    let n = n.max(2);
    let mut best = candidates[rng.gen_range(0..candidates.len())];
    let mut best_inflight = ctx
        .registry
        .get(&best.key)
        .map(|m| m.inflight())
        .unwrap_or(0);

    for _ in 1..n {
        let candidate = candidates[rng.gen_range(0..candidates.len())];
        let inflight = ctx
            .registry
            .get(&candidate.key)
            .map(|m| m.inflight())
            .unwrap_or(0);
        if inflight < best_inflight {
            best = candidate;
            best_inflight = inflight;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn endpoints(hosts: &[&str]) -> Vec<LbEndpoint> {
        hosts.iter().map(|h| LbEndpoint::new("http", *h)).collect()
    }

    fn ctx<'a>(registry: &'a EndpointRegistry, key: &'a str) -> SelectionContext<'a> {
        SelectionContext {
            registry,
            hash_key: key,
            passive_health: None,
            route_id: "test",
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let registry = EndpointRegistry::new();
        let group = LbGroup::new(
            endpoints(&["a:80", "b:80", "c:80"]),
            LbAlgorithm::from_name("roundRobin"),
        );

        let picks: Vec<&str> = (0..6)
            .map(|_| {
                select_endpoint(&group, &ctx(&registry, "client"))
                    .unwrap()
                    .host
                    .as_str()
            })
            .collect();
        assert_eq!(picks, ["a:80", "b:80", "c:80", "a:80", "b:80", "c:80"]);
    }

    #[test]
    fn test_random_covers_all_members() {
        let registry = EndpointRegistry::new();
        let group = LbGroup::new(endpoints(&["a:80", "b:80"]), LbAlgorithm::Random);

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..2000 {
            let pick = select_endpoint(&group, &ctx(&registry, "client")).unwrap();
            *counts.entry(pick.host.clone()).or_insert(0) += 1;
        }
        assert!(counts["a:80"] > 700, "a count: {}", counts["a:80"]);
        assert!(counts["b:80"] > 700, "b count: {}", counts["b:80"]);
    }

    #[test]
    fn test_consistent_hash_is_stable() {
        let registry = EndpointRegistry::new();
        let group = LbGroup::new(
            endpoints(&["a:80", "b:80", "c:80"]),
            LbAlgorithm::from_name("consistentHash"),
        );

        let first = select_endpoint(&group, &ctx(&registry, "10.1.2.3")).unwrap();
        for _ in 0..50 {
            let again = select_endpoint(&group, &ctx(&registry, "10.1.2.3")).unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_consistent_hash_spreads_keys() {
        let registry = EndpointRegistry::new();
        let group = LbGroup::new(
            endpoints(&["a:80", "b:80", "c:80"]),
            LbAlgorithm::from_name("consistentHash"),
        );

        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let key = format!("client-{}", i);
            let c = SelectionContext {
                registry: &registry,
                hash_key: &key,
                passive_health: None,
                route_id: "test",
            };
            seen.insert(select_endpoint(&group, &c).unwrap().host.clone());
        }
        assert_eq!(seen.len(), 3, "all members should receive some keys");
    }

    #[test]
    fn test_balance_factor_skips_loaded_winner() {
        let registry = EndpointRegistry::new();
        let members = endpoints(&["a:80", "b:80"]);
        let group = LbGroup::new(
            members.clone(),
            LbAlgorithm::ConsistentHash {
                balance_factor: Some(1.0),
            },
        );

        let winner = select_endpoint(&group, &ctx(&registry, "sticky")).unwrap().clone();
        let loser = members.iter().find(|e| **e != winner).unwrap().clone();

        // Pile in-flight load onto the hash winner.
        let winner_metrics = registry.ensure(&winner.key);
        let _guards: Vec<_> = (0..100).map(|_| winner_metrics.track_inflight()).collect();

        let pick = select_endpoint(&group, &ctx(&registry, "sticky")).unwrap();
        assert_eq!(*pick, loser, "overloaded winner must be skipped");
    }

    #[test]
    fn test_power_of_choices_prefers_idle() {
        let registry = EndpointRegistry::new();
        let members = endpoints(&["busy:80", "idle:80"]);
        let group = LbGroup::new(members, LbAlgorithm::PowerOfRandomNChoices { n: 8 });

        let busy = registry.ensure("http://busy:80");
        let _guards: Vec<_> = (0..50).map(|_| busy.track_inflight()).collect();

        let mut idle_picks = 0;
        for _ in 0..200 {
            if select_endpoint(&group, &ctx(&registry, "x")).unwrap().host == "idle:80" {
                idle_picks += 1;
            }
        }
        // With n=8 samples the idle endpoint wins almost every draw.
        assert!(idle_picks > 150, "idle picks: {}", idle_picks);
    }

    #[test]
    fn test_fade_in_shifts_share_to_old_endpoints() {
        let registry = EndpointRegistry::new();
        // Two aged endpoints, one brand new.
        registry.hint_detected("http://old1:80", Instant::now() - Duration::from_secs(10));
        registry.hint_detected("http://old2:80", Instant::now() - Duration::from_secs(10));
        registry.ensure("http://new:80");

        let mut group = LbGroup::new(
            endpoints(&["old1:80", "old2:80", "new:80"]),
            LbAlgorithm::Random,
        );
        group.fade_in_duration = Some(Duration::from_secs(5));
        group.fade_in_exponent = 2.0;

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..3000 {
            let pick = select_endpoint(&group, &ctx(&registry, "k")).unwrap();
            *counts.entry(pick.host.clone()).or_insert(0) += 1;
        }

        let young = *counts.get("new:80").unwrap_or(&0);
        let old = counts["old1:80"].max(counts["old2:80"]);
        // Weight of the fresh endpoint is ~0, so its share must be a small
        // fraction of an aged endpoint's.
        assert!(
            young * 10 < old,
            "young={} old={} — fade-in not biasing selection",
            young,
            old
        );
    }

    #[test]
    fn test_passive_health_never_empties_group() {
        let registry = EndpointRegistry::new();
        let metrics = registry.ensure("http://a:80");
        for _ in 0..100 {
            metrics.record_request(true);
        }
        let config = PassiveHealthConfig {
            enabled: true,
            max_unhealthy_endpoints_ratio: 1.0,
            ..Default::default()
        };
        registry.update_health(&config);
        assert!(metrics.drop_probability() > 0.0);

        let group = LbGroup::new(
            endpoints(&["a:80"]),
            LbAlgorithm::from_name("roundRobin"),
        );
        let c = SelectionContext {
            registry: &registry,
            hash_key: "k",
            passive_health: Some(&config),
            route_id: "test",
        };
        for _ in 0..100 {
            assert!(select_endpoint(&group, &c).is_some());
        }
    }

    #[test]
    fn test_selection_returns_group_member() {
        let registry = EndpointRegistry::new();
        let members = endpoints(&["a:80", "b:80", "c:80"]);
        for algorithm in [
            "roundRobin",
            "random",
            "consistentHash",
            "powerOfRandomNChoices",
        ] {
            let group = LbGroup::new(members.clone(), LbAlgorithm::from_name(algorithm));
            for _ in 0..50 {
                let pick = select_endpoint(&group, &ctx(&registry, "k")).unwrap();
                assert!(members.contains(pick), "algorithm {}", algorithm);
            }
        }
    }

    #[test]
    fn test_empty_group_returns_none() {
        let registry = EndpointRegistry::new();
        let group = LbGroup::new(vec![], LbAlgorithm::Random);
        assert!(select_endpoint(&group, &ctx(&registry, "k")).is_none());
    }

    #[test]
    fn test_inflight_shared_through_registry() {
        let registry = Arc::new(EndpointRegistry::new());
        let metrics = registry.ensure("http://a:80");
        let guard = metrics.track_inflight();
        assert_eq!(registry.ensure("http://a:80").inflight(), 1);
        drop(guard);
        assert_eq!(registry.ensure("http://a:80").inflight(), 0);
    }
}
