use crate::config::RouteDefinition;
use crate::proxy::filter::{Filter, FilterRegistry};
use crate::upstream::{LbAlgorithm, LbEndpoint, LbGroup};
use anyhow::{bail, Context, Result};
use http::{Method, Uri};
use std::sync::Arc;

/// Where a matched request goes. The set of kinds is fixed and closed, so a
/// tagged enum rather than a trait object.
pub enum Backend {
    /// Forward to a single explicit host.
    Network { scheme: String, host: String },
    /// Scheme/host resolved per request from the state bag.
    Dynamic,
    /// Pick an endpoint from the group per request.
    LoadBalanced(LbGroup),
    /// Serve locally; no backend contact.
    Shunt,
    /// Re-enter the proxy with a cloned context.
    Loopback,
}

impl Backend {
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Network { .. } => "network",
            Backend::Dynamic => "dynamic",
            Backend::LoadBalanced(_) => "loadBalanced",
            Backend::Shunt => "shunt",
            Backend::Loopback => "loopback",
        }
    }
}

/// Path predicate of the built-in route table: exact, or prefix when the
/// route file path ends in `/*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPredicate {
    Exact(String),
    Prefix(String),
}

/// One compiled route. Immutable once published; route table swaps replace
/// whole `Arc<Route>` values, never mutate them.
pub struct Route {
    pub id: String,
    pub path: PathPredicate,
    /// Empty means all methods.
    pub methods: Vec<Method>,
    pub filters: Vec<Arc<dyn Filter>>,
    pub backend: Backend,
}

impl Route {
    /// Compile a route-file definition, resolving filter names through the
    /// registry and parsing the backend address.
    pub fn compile(def: &RouteDefinition, registry: &FilterRegistry) -> Result<Self> {
        let path = if def.path == "/*" {
            PathPredicate::Prefix("/".to_string())
        } else if let Some(prefix) = def.path.strip_suffix("/*") {
            PathPredicate::Prefix(format!("{}/", prefix))
        } else {
            PathPredicate::Exact(def.path.clone())
        };

        let methods = def
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_uppercase().as_bytes())
                    .with_context(|| format!("route {}: bad method {:?}", def.id, m))
            })
            .collect::<Result<Vec<_>>>()?;

        let filters = def
            .filters
            .iter()
            .map(|spec| {
                registry
                    .create(spec)
                    .with_context(|| format!("route {}: filter {}", def.id, spec.name))
            })
            .collect::<Result<Vec<_>>>()?;

        let backend = if !def.lb_endpoints.is_empty() {
            let endpoints = def
                .lb_endpoints
                .iter()
                .map(|e| parse_endpoint(e))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("route {}", def.id))?;
            let algorithm = def
                .lb_algorithm
                .as_deref()
                .map(LbAlgorithm::from_name)
                .unwrap_or_else(|| LbAlgorithm::from_name("roundRobin"));
            let mut group = LbGroup::new(endpoints, algorithm);
            group.fade_in_duration = def.lb_fade_in_duration;
            group.fade_in_exponent = def.lb_fade_in_exponent;
            Backend::LoadBalanced(group)
        } else {
            match def.backend.as_str() {
                "<shunt>" => Backend::Shunt,
                "<loopback>" => Backend::Loopback,
                "<dynamic>" => Backend::Dynamic,
                "" => bail!("route {}: no backend and no lb endpoints", def.id),
                url => {
                    let endpoint = parse_endpoint(url)
                        .with_context(|| format!("route {}", def.id))?;
                    Backend::Network {
                        scheme: endpoint.scheme,
                        host: endpoint.host,
                    }
                }
            }
        };

        Ok(Self {
            id: def.id.clone(),
            path,
            methods,
            filters,
            backend,
        })
    }

    /// The host a network backend targets; `None` for every other kind
    /// (load-balanced hosts are only known after endpoint selection).
    pub fn backend_host(&self) -> Option<&str> {
        match &self.backend {
            Backend::Network { host, .. } => Some(host),
            _ => None,
        }
    }

    pub fn matches_method(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// Compact JSON description used by debug mode and the routes gauge.
    pub fn describe(&self) -> serde_json::Value {
        let backend = match &self.backend {
            Backend::Network { scheme, host } => format!("{}://{}", scheme, host),
            Backend::Dynamic => "<dynamic>".to_string(),
            Backend::Shunt => "<shunt>".to_string(),
            Backend::Loopback => "<loopback>".to_string(),
            Backend::LoadBalanced(group) => format!(
                "<{}, {}>",
                group.algorithm.name(),
                group
                    .endpoints
                    .iter()
                    .map(|e| e.key.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        serde_json::json!({
            "id": self.id,
            "path": match &self.path {
                PathPredicate::Exact(p) => p.clone(),
                PathPredicate::Prefix(p) => format!("{}*", p),
            },
            "filters": self.filters.iter().map(|f| f.name()).collect::<Vec<_>>(),
            "backend": backend,
        })
    }

    #[cfg(test)]
    pub fn for_tests(id: &str, backend: Backend) -> Self {
        Self {
            id: id.to_string(),
            path: PathPredicate::Prefix("/".to_string()),
            methods: Vec::new(),
            filters: Vec::new(),
            backend,
        }
    }
}

fn parse_endpoint(raw: &str) -> Result<LbEndpoint> {
    let uri: Uri = raw
        .parse()
        .with_context(|| format!("bad endpoint address {:?}", raw))?;
    let scheme = uri
        .scheme_str()
        .with_context(|| format!("endpoint {:?} missing scheme", raw))?
        .to_string();
    let authority = uri
        .authority()
        .with_context(|| format!("endpoint {:?} missing host", raw))?;
    Ok(LbEndpoint::new(scheme, authority.to_string()))
}
