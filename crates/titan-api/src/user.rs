//! Account profile fetch

use crate::client::ApiClient;
use crate::constants::USER_INFO_PATH;
use crate::error::Result;

/// Fetch the account profile with the channel's current bearer.
///
/// A 401/403 comes back as [`Error::Unauthorized`](crate::Error::Unauthorized);
/// deciding whether to refresh and retry is the caller's job, and the caller
/// must cap it.
pub async fn fetch_user_info(client: &ApiClient) -> Result<serde_json::Value> {
    let envelope = client.get(USER_INFO_PATH).await?.ensure_ok()?;
    Ok(envelope.payload())
}
