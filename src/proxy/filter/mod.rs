pub mod builtin;

use crate::config::FilterSpec;
use crate::proxy::context::RequestContext;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A route filter. Request-phase hooks run in chain order before dispatch,
/// response-phase hooks in reverse order afterwards. Implementations must
/// not assume they run at most once per process — the same filter instance
/// serves every request of its route.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn request(&self, _ctx: &mut RequestContext) {}

    fn response(&self, _ctx: &mut RequestContext) {}
}

/// Constructor for one filter kind: positional string args in, instance out.
pub type FilterConstructor = fn(&[String]) -> Result<Arc<dyn Filter>>;

/// Name → constructor map used when compiling routes.
pub struct FilterRegistry {
    constructors: HashMap<String, FilterConstructor>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry preloaded with the core-coupled filters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        builtin::register(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &str, constructor: FilterConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn create(&self, spec: &FilterSpec) -> Result<Arc<dyn Filter>> {
        let constructor = self
            .constructors
            .get(&spec.name)
            .ok_or_else(|| anyhow!("unknown filter: {}", spec.name))?;
        constructor(&spec.args)
    }
}

/// Tunables of the executor, derived from the proxy configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorOptions {
    /// Capture panics into the context instead of logging them.
    pub debug: bool,
    /// Emit start/end trace events around each filter call.
    pub log_filter_events: bool,
}

/// Only the first filter panic gets its backtrace logged; later ones are
/// counted without the stack to keep a panicking filter from flooding logs.
static PANIC_STACK_LOGGED: AtomicBool = AtomicBool::new(false);

/// Run the request phase. Returns how many filters were actually invoked —
/// a shunting filter halts the chain and is included in the count, and the
/// response phase replays exactly that prefix in reverse.
pub fn apply_request_filters(
    filters: &[Arc<dyn Filter>],
    ctx: &mut RequestContext,
    options: &ExecutorOptions,
) -> usize {
    let mut invoked = 0;
    for filter in filters {
        invoked += 1;
        run_isolated(filter.as_ref(), ctx, Phase::Request, options);
        if ctx.is_shunted() {
            break;
        }
    }
    invoked
}

/// Run the response phase over the invoked prefix, in reverse order.
pub fn apply_response_filters(
    filters: &[Arc<dyn Filter>],
    invoked: usize,
    ctx: &mut RequestContext,
    options: &ExecutorOptions,
) {
    for filter in filters[..invoked.min(filters.len())].iter().rev() {
        run_isolated(filter.as_ref(), ctx, Phase::Response, options);
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Request,
    Response,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Response => "response",
        }
    }
}

fn run_isolated(
    filter: &dyn Filter,
    ctx: &mut RequestContext,
    phase: Phase,
    options: &ExecutorOptions,
) {
    if options.log_filter_events {
        tracing::trace!(filter = filter.name(), phase = phase.label(), "start");
    }
    let start = Instant::now();

    let outcome = catch_unwind(AssertUnwindSafe(|| match phase {
        Phase::Request => filter.request(ctx),
        Phase::Response => filter.response(ctx),
    }));

    metrics::histogram!(format!("filter.{}.{}", filter.name(), phase.label()))
        .record(start.elapsed().as_secs_f64());
    if options.log_filter_events {
        tracing::trace!(filter = filter.name(), phase = phase.label(), "end");
    }

    if let Err(panic) = outcome {
        let message = panic_message(panic.as_ref());
        if options.debug {
            ctx.debug_filter_panics
                .push(format!("{} ({}): {}", filter.name(), phase.label(), message));
            return;
        }
        metrics::counter!("filter.panics").increment(1);
        if !PANIC_STACK_LOGGED.swap(true, Ordering::Relaxed) {
            let backtrace = std::backtrace::Backtrace::force_capture();
            tracing::error!(
                filter = filter.name(),
                phase = phase.label(),
                %backtrace,
                "filter panicked: {}",
                message
            );
        } else {
            tracing::error!(
                filter = filter.name(),
                phase = phase.label(),
                "filter panicked: {}",
                message
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::full_body;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    fn test_ctx() -> RequestContext {
        let req = hyper::Request::builder()
            .uri("/")
            .header("host", "t")
            .body(full_body(""))
            .unwrap();
        let peer: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        RequestContext::new(req, peer, false)
    }

    struct Recording {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        shunt_on_request: bool,
        panic_on_request: bool,
    }

    impl Recording {
        fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Filter> {
            Arc::new(Self {
                name: name.to_string(),
                log,
                shunt_on_request: false,
                panic_on_request: false,
            })
        }
    }

    impl Filter for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn request(&self, ctx: &mut RequestContext) {
            self.log.lock().unwrap().push(format!("{}:req", self.name));
            if self.panic_on_request {
                panic!("boom in {}", self.name);
            }
            if self.shunt_on_request {
                ctx.shunt();
            }
        }

        fn response(&self, _ctx: &mut RequestContext) {
            self.log.lock().unwrap().push(format!("{}:resp", self.name));
        }
    }

    #[test]
    fn test_request_order_and_reverse_response_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let filters = vec![
            Recording::new("a", log.clone()),
            Recording::new("b", log.clone()),
            Recording::new("c", log.clone()),
        ];
        let mut ctx = test_ctx();
        let options = ExecutorOptions::default();

        let invoked = apply_request_filters(&filters, &mut ctx, &options);
        assert_eq!(invoked, 3);
        apply_response_filters(&filters, invoked, &mut ctx, &options);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:req", "b:req", "c:req", "c:resp", "b:resp", "a:resp"]
        );
    }

    #[test]
    fn test_shunt_halts_chain_and_keeps_shunting_filter() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shunting: Arc<dyn Filter> = Arc::new(Recording {
            name: "b".into(),
            log: log.clone(),
            shunt_on_request: true,
            panic_on_request: false,
        });
        let filters = vec![
            Recording::new("a", log.clone()),
            shunting,
            Recording::new("c", log.clone()),
        ];
        let mut ctx = test_ctx();
        let options = ExecutorOptions::default();

        let invoked = apply_request_filters(&filters, &mut ctx, &options);
        assert_eq!(invoked, 2, "chain halts at the shunting filter");
        apply_response_filters(&filters, invoked, &mut ctx, &options);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:req", "b:req", "b:resp", "a:resp"]
        );
    }

    #[test]
    fn test_panic_is_isolated_and_chain_continues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let panicking: Arc<dyn Filter> = Arc::new(Recording {
            name: "bad".into(),
            log: log.clone(),
            shunt_on_request: false,
            panic_on_request: true,
        });
        let filters = vec![panicking, Recording::new("after", log.clone())];
        let mut ctx = test_ctx();

        let invoked = apply_request_filters(&filters, &mut ctx, &ExecutorOptions::default());
        assert_eq!(invoked, 2);
        assert!(log.lock().unwrap().contains(&"after:req".to_string()));
    }

    #[test]
    fn test_panic_captured_in_debug_mode() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let panicking: Arc<dyn Filter> = Arc::new(Recording {
            name: "bad".into(),
            log,
            shunt_on_request: false,
            panic_on_request: true,
        });
        let mut ctx = test_ctx();
        let options = ExecutorOptions {
            debug: true,
            ..Default::default()
        };

        apply_request_filters(&[panicking], &mut ctx, &options);
        assert_eq!(ctx.debug_filter_panics.len(), 1);
        assert!(ctx.debug_filter_panics[0].contains("boom in bad"));
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let mut ctx = test_ctx();
        let before_headers = ctx.headers.clone();
        let before_uri = ctx.uri.clone();

        let invoked = apply_request_filters(&[], &mut ctx, &ExecutorOptions::default());
        apply_response_filters(&[], invoked, &mut ctx, &ExecutorOptions::default());

        assert_eq!(invoked, 0);
        assert_eq!(ctx.headers, before_headers);
        assert_eq!(ctx.uri, before_uri);
        assert!(!ctx.is_shunted());
    }

    #[test]
    fn test_unknown_filter_fails_construction() {
        let registry = FilterRegistry::with_builtins();
        let spec = FilterSpec {
            name: "definitelyNotAFilter".into(),
            args: vec![],
        };
        assert!(registry.create(&spec).is_err());
    }
}
