//! Identity claims carried inside the access credential
//!
//! The access credential is JWT-shaped (`header.payload.signature`). The
//! payload is decoded without verification: the node already verified it,
//! we only need the identity fields for logging and the stream handshake.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use tracing::debug;

/// Identity fields derived from an access credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Claims {
    #[serde(default, deserialize_with = "string_or_number")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Expiry as unix seconds
    #[serde(default)]
    pub exp: Option<u64>,
}

impl Claims {
    /// Decode the claims of an access credential.
    ///
    /// Returns empty claims for anything that is not a decodable JWT.
    pub fn decode(token: &str) -> Self {
        let Some(payload) = token.split('.').nth(1) else {
            debug!("access credential is not JWT-shaped");
            return Self::default();
        };

        // Some issuers keep the padding; the no-pad engine rejects it.
        let payload = payload.trim_end_matches('=');
        let bytes = match URL_SAFE_NO_PAD.decode(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "access credential payload is not base64url");
                return Self::default();
            }
        };

        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            debug!(error = %e, "access credential payload is not a claims object");
            Self::default()
        })
    }
}

/// Node user ids are numeric in some tokens and strings in others.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
