//! Endpoint: one node's API base and stream base

use std::fmt;

use reqwest::Url;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Known node hosts, in default rotation order.
pub const DEFAULT_HOSTS: &[&str] = &[
    "task.titannet.info",
    "task.titanedge.cn",
    "task.titannet.io",
    "task.titandev.info",
];

/// API + stream base pair. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    api: Url,
    stream: Url,
}

impl Endpoint {
    /// Parse and validate both bases: API must be http(s), stream ws(s).
    pub fn new(api: &str, stream: &str) -> Result<Self> {
        let api = parse_with_scheme(api, &["http", "https"])?;
        let stream = parse_with_scheme(stream, &["ws", "wss"])?;
        Ok(Self { api, stream })
    }

    /// `https://<host>` + `wss://<host>`.
    pub fn for_host(host: &str) -> Result<Self> {
        Self::new(&format!("https://{host}"), &format!("wss://{host}"))
    }

    pub fn api(&self) -> &Url {
        &self.api
    }

    pub fn stream(&self) -> &Url {
        &self.stream
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api.as_str().trim_end_matches('/'))
    }
}

/// Shape of an endpoint in config files and harbor answers.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEndpoint {
    pub api: String,
    #[serde(alias = "ws")]
    pub stream: String,
}

impl TryFrom<&RawEndpoint> for Endpoint {
    type Error = Error;

    fn try_from(raw: &RawEndpoint) -> Result<Self> {
        Endpoint::new(&raw.api, &raw.stream)
    }
}

/// The built-in pool.
pub fn default_endpoints() -> Vec<Endpoint> {
    DEFAULT_HOSTS
        .iter()
        .filter_map(|host| Endpoint::for_host(host).ok())
        .collect()
}

fn parse_with_scheme(raw: &str, schemes: &[&str]) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidEndpoint(format!("{raw}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(Error::InvalidEndpoint(format!(
            "{raw}: scheme must be one of {}",
            schemes.join("/")
        )));
    }
    if url.host_str().is_none() {
        return Err(Error::InvalidEndpoint(format!("{raw}: missing host")));
    }
    Ok(url)
}
