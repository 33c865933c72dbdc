pub mod loadbalance;
pub mod registry;
pub mod transport;

pub use loadbalance::{LbAlgorithm, LbEndpoint, LbGroup};
pub use registry::{start_passive_health_updater, EndpointMetrics, EndpointRegistry};
pub use transport::{build_http_client, HttpClient};
