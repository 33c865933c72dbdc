mod route;
mod source;
mod table;

pub use route::{Backend, PathPredicate, Route};
pub use source::{FileRouteSource, RouteSource};
pub use table::{PathParams, PriorityRoute, RouteLookup, Router, RouteTable};
