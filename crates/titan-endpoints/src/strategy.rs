//! How an account picks a live endpoint
//!
//! Both variants first walk the pool from the current entry, probing each
//! once. `DiscoveryFallback` then consults harbor discovery and adopts the
//! first candidate that answers a probe.

use serde::Serialize;
use tracing::{info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::harbor::HarborDiscovery;
use crate::pool::EndpointPool;
use crate::probe::Prober;

#[derive(Debug, Clone)]
pub enum EndpointStrategy {
    StaticPool,
    DiscoveryFallback { discovery: HarborDiscovery },
}

impl EndpointStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            EndpointStrategy::StaticPool => "static_pool",
            EndpointStrategy::DiscoveryFallback { .. } => "discovery_fallback",
        }
    }

    /// Leave `pool` positioned at a live endpoint and return it.
    ///
    /// `descriptor` is only sent to harbor bootstraps. Fails with
    /// `NoEndpointAvailable` when nothing answers.
    pub async fn ensure_live<D: Serialize + ?Sized>(
        &self,
        pool: &mut EndpointPool,
        prober: &Prober,
        descriptor: &D,
    ) -> Result<Endpoint> {
        for _ in 0..pool.len() {
            let candidate = pool.current().clone();
            if prober.is_alive(&candidate).await {
                return Ok(candidate);
            }
            warn!(endpoint = %candidate, "endpoint unreachable");
            pool.advance();
        }

        match self {
            EndpointStrategy::StaticPool => Err(Error::NoEndpointAvailable(format!(
                "all {} pool endpoints unreachable",
                pool.len()
            ))),
            EndpointStrategy::DiscoveryFallback { discovery } => {
                info!("pool exhausted, starting harbor discovery");
                let candidates = discovery.discover(descriptor).await.map_err(|e| {
                    Error::NoEndpointAvailable(format!("pool unreachable and {e}"))
                })?;

                for candidate in candidates {
                    if prober.is_alive(&candidate).await {
                        return Ok(pool.adopt(candidate).clone());
                    }
                    warn!(endpoint = %candidate, "harbor candidate unreachable");
                }
                Err(Error::NoEndpointAvailable(
                    "pool and every harbor candidate unreachable".into(),
                ))
            }
        }
    }
}
