//! Titan node HTTP API client
//!
//! Everything an account needs to talk to a node's REST surface:
//! the `{code, msg, data}` response envelope, the credential manager that
//! turns a long-lived refresh credential into a short-lived access
//! credential, device registration, and an optional on-disk account store
//! so a later run can resume without re-login.
//!
//! Credential flow:
//! 1. `CredentialManager::refresh()` exchanges the refresh credential
//! 2. On rejection, `CredentialManager::login()` runs once if email/password are configured
//! 3. The access credential becomes the client's bearer for every later call
//! 4. `AccountStore::record()` persists the new credential pair

pub mod claims;
pub mod classify;
pub mod client;
pub mod constants;
pub mod credentials;
pub mod device;
pub mod envelope;
pub mod error;
pub mod store;
pub mod traffic;
pub mod user;

pub use claims::Claims;
pub use classify::{StatusClass, classify_status};
pub use client::{ApiClient, HttpSettings, build_http_client};
pub use constants::*;
pub use credentials::{AccessCredential, CredentialManager, LoginCredentials};
pub use device::{DeviceDescriptor, Registration, register_device};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use store::{AccountStore, StoredAccount};
pub use traffic::TrafficCounters;
pub use user::fetch_user_info;
