pub mod context;
pub mod debug;
pub mod filter;
mod handler;
pub mod stream;
pub mod upgrade;

pub use context::{BoxBody, BoxError, RequestContext, StateBag};
pub use handler::{Proxy, ProxyParams};
