use crate::routing::{PathPredicate, Route};
use arc_swap::ArcSwap;
use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::sync::Arc;

pub type PathParams = Vec<(String, String)>;

/// The compiled matching structure exposed by the route source. The proxy
/// core only depends on this interface; predicate compilation stays with
/// the data source.
pub trait Router: Send + Sync {
    fn lookup(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Option<(Arc<Route>, PathParams)>;
}

/// Matchers consulted before the router tree, in registration order.
/// First hit wins.
pub trait PriorityRoute: Send + Sync {
    fn matches(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Option<(Arc<Route>, PathParams)>;
}

/// Built-in path router: exact entries first, then longest matching prefix.
/// Prefix matches expose the path remainder as the `*` parameter.
pub struct RouteTable {
    exact: HashMap<String, Vec<Arc<Route>>>,
    /// Sorted by prefix length, longest first.
    prefixes: Vec<(String, Vec<Arc<Route>>)>,
    route_count: usize,
}

impl RouteTable {
    pub fn build(routes: Vec<Route>) -> Self {
        let mut exact: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        let mut prefix_map: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        let route_count = routes.len();

        for route in routes {
            let route = Arc::new(route);
            match route.path.clone() {
                PathPredicate::Exact(path) => exact.entry(path).or_default().push(route),
                PathPredicate::Prefix(path) => prefix_map.entry(path).or_default().push(route),
            }
        }

        let mut prefixes: Vec<(String, Vec<Arc<Route>>)> = prefix_map.into_iter().collect();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            exact,
            prefixes,
            route_count,
        }
    }

    pub fn empty() -> Self {
        Self::build(Vec::new())
    }

    pub fn route_count(&self) -> usize {
        self.route_count
    }

    pub fn all_routes(&self) -> Vec<Arc<Route>> {
        let mut all: Vec<Arc<Route>> = Vec::with_capacity(self.route_count);
        for routes in self.exact.values() {
            all.extend(routes.iter().cloned());
        }
        for (_, routes) in &self.prefixes {
            all.extend(routes.iter().cloned());
        }
        all
    }

    fn first_matching(routes: &[Arc<Route>], method: &Method) -> Option<Arc<Route>> {
        routes.iter().find(|r| r.matches_method(method)).cloned()
    }
}

impl Router for RouteTable {
    fn lookup(
        &self,
        method: &Method,
        path: &str,
        _headers: &HeaderMap,
    ) -> Option<(Arc<Route>, PathParams)> {
        if let Some(routes) = self.exact.get(path) {
            if let Some(route) = Self::first_matching(routes, method) {
                return Some((route, Vec::new()));
            }
        }

        for (prefix, routes) in &self.prefixes {
            let matches = if prefix == "/" {
                true
            } else {
                path.starts_with(prefix.as_str()) || path == &prefix[..prefix.len() - 1]
            };
            if !matches {
                continue;
            }
            if let Some(route) = Self::first_matching(routes, method) {
                let rest = path.strip_prefix(prefix.as_str()).unwrap_or("");
                return Some((route, vec![("*".to_string(), rest.to_string())]));
            }
        }

        None
    }
}

/// Everything the lookup adapter needs from one published route table:
/// the matcher plus the gauge inputs derived from it.
struct RouteSnapshot {
    router: Arc<dyn Router>,
    count: usize,
    bytes: usize,
}

/// The route lookup adapter: ordered priority routes first, then the
/// swapped-in router. Snapshots replace atomically; readers never block.
pub struct RouteLookup {
    priority_routes: Vec<Box<dyn PriorityRoute>>,
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteLookup {
    pub fn new(priority_routes: Vec<Box<dyn PriorityRoute>>) -> Self {
        Self {
            priority_routes,
            snapshot: ArcSwap::from_pointee(RouteSnapshot {
                router: Arc::new(RouteTable::empty()),
                count: 0,
                bytes: 0,
            }),
        }
    }

    /// Publish a freshly built route table and update the route gauges.
    pub fn swap_table(&self, table: RouteTable) {
        let count = table.route_count();
        let bytes = table
            .all_routes()
            .iter()
            .map(|r| r.describe().to_string().len())
            .sum();
        self.swap_router(Arc::new(table), count, bytes);
    }

    /// Publish any router implementation (e.g. a table built out-of-process).
    pub fn swap_router(&self, router: Arc<dyn Router>, count: usize, bytes: usize) {
        self.snapshot.store(Arc::new(RouteSnapshot {
            router,
            count,
            bytes,
        }));
        metrics::gauge!("routes.total").set(count as f64);
        metrics::gauge!("routes.byte").set(bytes as f64);
        tracing::info!("routing: route table swapped, count={}", count);
    }

    pub fn lookup(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Option<(Arc<Route>, PathParams)> {
        for priority in &self.priority_routes {
            if let Some(hit) = priority.matches(method, path, headers) {
                return Some(hit);
            }
        }
        self.snapshot.load().router.lookup(method, path, headers)
    }

    pub fn route_count(&self) -> usize {
        self.snapshot.load().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Backend;

    fn route(id: &str, path: &str) -> Route {
        let mut r = Route::for_tests(
            id,
            Backend::Network {
                scheme: "http".into(),
                host: "b:80".into(),
            },
        );
        r.path = if let Some(prefix) = path.strip_suffix("/*") {
            if prefix.is_empty() {
                PathPredicate::Prefix("/".into())
            } else {
                PathPredicate::Prefix(format!("{}/", prefix))
            }
        } else {
            PathPredicate::Exact(path.to_string())
        };
        r
    }

    fn lookup<'a>(table: &RouteTable, method: &Method, path: &str) -> Option<String> {
        table
            .lookup(method, path, &HeaderMap::new())
            .map(|(r, _)| r.id.clone())
    }

    #[test]
    fn test_exact_wins_over_prefix() {
        let table = RouteTable::build(vec![
            route("catchall", "/*"),
            route("exact", "/v1/users/list"),
        ]);
        assert_eq!(
            lookup(&table, &Method::GET, "/v1/users/list").as_deref(),
            Some("exact")
        );
        assert_eq!(
            lookup(&table, &Method::GET, "/other").as_deref(),
            Some("catchall")
        );
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RouteTable::build(vec![route("shallow", "/api/*"), route("deep", "/api/v1/*")]);
        assert_eq!(
            lookup(&table, &Method::GET, "/api/v1/users").as_deref(),
            Some("deep")
        );
        assert_eq!(
            lookup(&table, &Method::GET, "/api/v2/users").as_deref(),
            Some("shallow")
        );
    }

    #[test]
    fn test_method_filter() {
        let mut post_only = route("post", "/submit");
        post_only.methods = vec![Method::POST];
        let table = RouteTable::build(vec![post_only, route("fallback", "/*")]);

        assert_eq!(
            lookup(&table, &Method::POST, "/submit").as_deref(),
            Some("post")
        );
        assert_eq!(
            lookup(&table, &Method::GET, "/submit").as_deref(),
            Some("fallback")
        );
    }

    #[test]
    fn test_prefix_match_exposes_remainder_param() {
        let table = RouteTable::build(vec![route("api", "/api/*")]);
        let (_, params) = table
            .lookup(&Method::GET, "/api/v1/users", &HeaderMap::new())
            .unwrap();
        assert_eq!(params, vec![("*".to_string(), "v1/users".to_string())]);
    }

    #[test]
    fn test_no_match() {
        let table = RouteTable::build(vec![route("api", "/api/*")]);
        assert_eq!(lookup(&table, &Method::GET, "/other"), None);
    }

    #[test]
    fn test_priority_routes_win() {
        struct Always(Arc<Route>);
        impl PriorityRoute for Always {
            fn matches(
                &self,
                _method: &Method,
                _path: &str,
                _headers: &HeaderMap,
            ) -> Option<(Arc<Route>, PathParams)> {
                Some((self.0.clone(), Vec::new()))
            }
        }

        let priority = Arc::new(route("priority", "/p"));
        let lookup_adapter = RouteLookup::new(vec![Box::new(Always(priority))]);
        lookup_adapter.swap_table(RouteTable::build(vec![route("normal", "/*")]));

        let (hit, _) = lookup_adapter
            .lookup(&Method::GET, "/anything", &HeaderMap::new())
            .unwrap();
        assert_eq!(hit.id, "priority");
    }

    #[test]
    fn test_swap_replaces_table() {
        let adapter = RouteLookup::new(Vec::new());
        adapter.swap_table(RouteTable::build(vec![route("old", "/*")]));
        assert_eq!(adapter.route_count(), 1);

        adapter.swap_table(RouteTable::build(vec![route("a", "/a"), route("b", "/b")]));
        assert_eq!(adapter.route_count(), 2);
        let (hit, _) = adapter
            .lookup(&Method::GET, "/a", &HeaderMap::new())
            .unwrap();
        assert_eq!(hit.id, "a");
        assert!(adapter
            .lookup(&Method::GET, "/other", &HeaderMap::new())
            .is_none());
    }
}
