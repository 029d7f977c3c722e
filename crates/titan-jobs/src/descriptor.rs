//! Job descriptors and the listing call

use serde::{Deserialize, Deserializer};
use titan_api::{ApiClient, JOBS_PATH};

use crate::error::{Error, Result};

/// A job as listed by the node. Consumed, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobDescriptor {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub script_url: String,
    /// Hex SHA-256 of the script body
    pub script_hash: String,
}

#[derive(Deserialize)]
struct JobListing {
    #[serde(default)]
    jobs: Vec<JobDescriptor>,
}

/// `GET /api/websockets/jobs`. Accepts the enveloped and the bare
/// `{"jobs": [...]}` shapes.
pub async fn list_jobs(client: &ApiClient) -> Result<Vec<JobDescriptor>> {
    let listing: JobListing = client
        .get(JOBS_PATH)
        .await
        .and_then(titan_api::Envelope::ensure_ok)
        .and_then(titan_api::Envelope::into_data)
        .map_err(|e| Error::from_api(e, Error::Listing))?;
    Ok(listing.jobs)
}

fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}
