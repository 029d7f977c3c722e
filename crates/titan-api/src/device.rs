//! Device descriptor and idempotent registration

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::client::ApiClient;
use crate::constants::{EXT_VERSION, LANGUAGE, REGISTER_PATH};
use crate::error::{Error, Result};

/// What a node reports about itself on registration and harbor discovery.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDescriptor {
    pub ext_version: String,
    pub language: String,
    pub user_script_enabled: bool,
    pub device_id: String,
    /// RFC 3339, fixed for the lifetime of the process
    pub install_time: String,
}

impl DeviceDescriptor {
    /// Descriptor with a fresh random device id, stable for this process run.
    pub fn generate() -> Self {
        Self::with_device_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_device_id(device_id: String) -> Self {
        Self {
            ext_version: EXT_VERSION.to_string(),
            language: LANGUAGE.to_string(),
            user_script_enabled: true,
            device_id,
            install_time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Outcome of a registration call that reached the server.
#[derive(Debug)]
pub enum Registration {
    /// Accepted; carries the initial point balance
    Registered { initial_points: serde_json::Value },
    /// Refused for a non-transport reason (e.g. already registered).
    /// Always an [`Error::Registration`]; callers log it and carry on.
    Rejected(Error),
}

/// Register the device with the channel's current endpoint.
///
/// Transport-level failures and auth rejections are returned as `Err`; any
/// other refusal is a [`Registration::Rejected`], since registering an
/// already-registered device must not stop the account.
pub async fn register_device(client: &ApiClient, descriptor: &DeviceDescriptor) -> Result<Registration> {
    match client.post(REGISTER_PATH, descriptor).await {
        Ok(envelope) if envelope.is_ok() => {
            let initial_points = envelope.payload();
            info!(device_id = %descriptor.device_id, points = %initial_points, "device registered");
            Ok(Registration::Registered { initial_points })
        }
        Ok(envelope) => {
            let message = envelope.message();
            warn!(device_id = %descriptor.device_id, error = %message, "device registration rejected");
            Ok(Registration::Rejected(Error::Registration(message)))
        }
        Err(e) if e.is_transport() || e.is_auth() => Err(e),
        Err(e) => {
            warn!(device_id = %descriptor.device_id, error = %e, "device registration rejected");
            Ok(Registration::Rejected(Error::Registration(e.to_string())))
        }
    }
}
