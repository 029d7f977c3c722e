//! Node endpoint selection
//!
//! An account talks to one node endpoint at a time (an API base plus a
//! stream base). The endpoint pool is an ordered, per-account cursor over
//! equivalent endpoints; the strategy decides how a live one is picked:
//!
//! - `StaticPool`: probe the current endpoint, rotate through the pool
//! - `DiscoveryFallback`: same, then ask the harbor bootstrap list for
//!   candidates and adopt the first one that answers a liveness probe

pub mod endpoint;
pub mod error;
pub mod harbor;
pub mod pool;
pub mod probe;
pub mod strategy;

pub use endpoint::{DEFAULT_HOSTS, Endpoint, RawEndpoint, default_endpoints};
pub use error::{Error, Result};
pub use harbor::HarborDiscovery;
pub use pool::EndpointPool;
pub use probe::Prober;
pub use strategy::EndpointStrategy;
