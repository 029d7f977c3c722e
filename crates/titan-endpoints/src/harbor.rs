//! Harbor discovery
//!
//! Asks each bootstrap URL in turn for candidate endpoints:
//! `POST <bootstrap>/api/harbor/discover` with the device descriptor,
//! answered by an envelope whose `data` is a list of `{api, ws}` pairs.
//! Candidates from every bootstrap are merged in order, duplicates dropped.

use reqwest::Url;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use titan_api::{Envelope, HARBOR_DISCOVER_PATH};
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, RawEndpoint};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct HarborDiscovery {
    http: reqwest::Client,
    bootstrap_urls: Vec<Url>,
}

impl HarborDiscovery {
    pub fn new(http: reqwest::Client, bootstrap_urls: Vec<Url>) -> Self {
        Self {
            http,
            bootstrap_urls,
        }
    }

    /// Collect candidates from every bootstrap URL.
    ///
    /// A bootstrap that fails is logged and skipped; only when none of them
    /// yields a candidate does discovery fail.
    pub async fn discover<D: Serialize + ?Sized>(&self, descriptor: &D) -> Result<Vec<Endpoint>> {
        let body = serde_json::to_vec(descriptor)
            .map_err(|e| Error::Discovery(format!("encoding descriptor: {e}")))?;

        let mut candidates: Vec<Endpoint> = Vec::new();
        for bootstrap in &self.bootstrap_urls {
            match self.query(bootstrap, &body).await {
                Ok(found) => {
                    debug!(bootstrap = %bootstrap, candidates = found.len(), "harbor answered");
                    for endpoint in found {
                        if !candidates.contains(&endpoint) {
                            candidates.push(endpoint);
                        }
                    }
                }
                Err(e) => warn!(bootstrap = %bootstrap, error = %e, "harbor bootstrap failed"),
            }
        }

        if candidates.is_empty() {
            return Err(Error::Discovery("no candidates from any bootstrap".into()));
        }
        info!(candidates = candidates.len(), "harbor discovery finished");
        Ok(candidates)
    }

    async fn query(&self, bootstrap: &Url, body: &[u8]) -> Result<Vec<Endpoint>> {
        let url = bootstrap
            .join(HARBOR_DISCOVER_PATH)
            .map_err(|e| Error::Discovery(format!("{bootstrap}: {e}")))?;
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Discovery(format!("reading response: {e}")))?;
        if !status.is_success() {
            return Err(Error::Discovery(format!("status {status}")));
        }

        let raw: Vec<RawEndpoint> = Envelope::parse(&bytes)
            .and_then(Envelope::ensure_ok)
            .and_then(Envelope::into_data)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        // A malformed candidate does not spoil the rest of the list.
        Ok(raw
            .iter()
            .filter_map(|r| match Endpoint::try_from(r) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    warn!(error = %e, "ignoring invalid harbor candidate");
                    None
                }
            })
            .collect())
    }
}
