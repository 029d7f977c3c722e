//! Endpoint pool: ordered endpoints with a rotating cursor
//!
//! Each account owns its pool, so the cursor needs no synchronization.
//! `advance()` on a single-entry pool returns the same entry; callers
//! count a full cycle as "no alternative left".

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct EndpointPool {
    endpoints: Vec<Endpoint>,
    index: usize,
}

impl EndpointPool {
    /// Create a pool positioned at the first entry.
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::EmptyPool);
        }
        Ok(Self {
            endpoints,
            index: 0,
        })
    }

    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.index]
    }

    /// Rotate to `(index + 1) mod len` and return the new current endpoint.
    pub fn advance(&mut self) -> &Endpoint {
        self.index = (self.index + 1) % self.endpoints.len();
        debug!(index = self.index, endpoint = %self.endpoints[self.index], "rotated endpoint");
        &self.endpoints[self.index]
    }

    /// Make `endpoint` current, appending it if the pool does not know it.
    pub fn adopt(&mut self, endpoint: Endpoint) -> &Endpoint {
        match self.endpoints.iter().position(|e| *e == endpoint) {
            Some(idx) => self.index = idx,
            None => {
                info!(endpoint = %endpoint, "adopting discovered endpoint");
                self.endpoints.push(endpoint);
                self.index = self.endpoints.len() - 1;
            }
        }
        &self.endpoints[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false: construction rejects empty pools.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn has_alternatives(&self) -> bool {
        self.endpoints.len() > 1
    }
}
