//! Credential manager: refresh credential → live access credential
//!
//! One manager per account. It owns the account's [`ApiClient`] so that a
//! successful refresh or login immediately becomes the bearer for every
//! later call on that channel. The refresh credential is only replaced by
//! an explicit login.

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::claims::{Claims, string_or_number};
use crate::client::ApiClient;
use crate::constants::{LOGIN_PATH, REFRESH_PATH};
use crate::error::{Error, Result};

/// Primary credentials for the login fallback.
#[derive(Debug, Clone)]
pub struct LoginCredentials {
    pub email: String,
    pub password: Secret<String>,
}

/// A live access credential and the identity derived from it.
#[derive(Debug, Clone)]
pub struct AccessCredential {
    pub access: Secret<String>,
    pub user_id: Option<String>,
    pub email: Option<String>,
    /// New refresh credential; only a login produces one
    pub refresh: Option<Secret<String>>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshData {
    access_token: String,
    #[serde(default, deserialize_with = "string_or_number")]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginData {
    access_token: String,
    refresh_token: String,
    #[serde(default, deserialize_with = "string_or_number")]
    user_id: Option<String>,
}

/// Per-account credential state.
///
/// Cloning shares the traffic counters; a clone can refresh off the
/// session loop and then replace the original.
#[derive(Clone)]
pub struct CredentialManager {
    account: String,
    refresh: Secret<String>,
    login: Option<LoginCredentials>,
    current: Option<AccessCredential>,
    client: ApiClient,
}

impl CredentialManager {
    pub fn new(
        account: impl Into<String>,
        refresh: Secret<String>,
        login: Option<LoginCredentials>,
        client: ApiClient,
    ) -> Self {
        Self {
            account: account.into(),
            refresh,
            login,
            current: None,
            client,
        }
    }

    /// Account label used in log context.
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut ApiClient {
        &mut self.client
    }

    pub fn refresh_token(&self) -> &Secret<String> {
        &self.refresh
    }

    pub fn current(&self) -> Option<&AccessCredential> {
        self.current.as_ref()
    }

    pub fn access_token(&self) -> Option<&Secret<String>> {
        self.current.as_ref().map(|c| &c.access)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.current.as_ref().and_then(|c| c.user_id.as_deref())
    }

    pub fn email(&self) -> Option<&str> {
        self.current.as_ref().and_then(|c| c.email.as_deref())
    }

    pub fn has_login(&self) -> bool {
        self.login.is_some()
    }

    /// Drop the current access credential after a 401-equivalent rejection.
    ///
    /// [`access_token`](Self::access_token) returns `None` until the next
    /// successful refresh or login.
    pub fn invalidate(&mut self) {
        self.client.clear_bearer();
        if self.current.take().is_some() {
            warn!(account = %self.account, "access credential rejected, discarding");
        }
    }

    /// Exchange the refresh credential for an access credential.
    ///
    /// Any transport failure or non-success answer is `RefreshDenied`,
    /// carrying the server message when there is one.
    pub async fn refresh(&mut self) -> Result<AccessCredential> {
        info!(account = %self.account, "refreshing access credential");
        let request = RefreshRequest {
            refresh_token: self.refresh.expose(),
        };

        let data: RefreshData = match self.client.post(REFRESH_PATH, &request).await {
            Ok(envelope) if envelope.is_ok() => envelope
                .into_data()
                .map_err(|e| Error::RefreshDenied(e.to_string()))?,
            Ok(envelope) => {
                let message = envelope.message();
                warn!(account = %self.account, error = %message, "refresh rejected");
                return Err(Error::RefreshDenied(message));
            }
            Err(e) => {
                warn!(account = %self.account, error = %e, "refresh request failed");
                return Err(Error::RefreshDenied(e.to_string()));
            }
        };

        let claims = Claims::decode(&data.access_token);
        let credential = AccessCredential {
            user_id: data.user_id.or(claims.user_id),
            email: data.email.or(claims.email),
            access: Secret::new(data.access_token),
            refresh: None,
        };
        self.apply(credential.clone());

        let traffic = self.client.traffic();
        info!(
            account = %self.account,
            email = credential.email.as_deref().unwrap_or("Unknown"),
            sent_bytes = traffic.sent(),
            received_bytes = traffic.received(),
            "access credential refreshed"
        );
        Ok(credential)
    }

    /// Log in with primary credentials; also yields a new refresh credential.
    pub async fn login(&mut self) -> Result<AccessCredential> {
        let Some(login) = self.login.clone() else {
            return Err(Error::LoginDenied(
                "no primary credentials configured".into(),
            ));
        };
        info!(account = %self.account, email = %login.email, "logging in with primary credentials");

        let request = LoginRequest {
            email: &login.email,
            password: login.password.expose(),
        };
        let data: LoginData = match self.client.post(LOGIN_PATH, &request).await {
            Ok(envelope) if envelope.is_ok() => envelope
                .into_data()
                .map_err(|e| Error::LoginDenied(e.to_string()))?,
            Ok(envelope) => return Err(Error::LoginDenied(envelope.message())),
            Err(e) => return Err(Error::LoginDenied(e.to_string())),
        };

        let claims = Claims::decode(&data.access_token);
        let refresh = Secret::new(data.refresh_token);
        let credential = AccessCredential {
            user_id: data.user_id.or(claims.user_id),
            email: claims.email.or(Some(login.email.clone())),
            access: Secret::new(data.access_token),
            refresh: Some(refresh.clone()),
        };
        self.refresh = refresh;
        self.apply(credential.clone());

        info!(account = %self.account, "login succeeded, refresh credential replaced");
        Ok(credential)
    }

    /// Refresh, falling back to a single login when primary credentials exist.
    ///
    /// Without primary credentials the refresh error propagates unchanged.
    pub async fn authenticate(&mut self) -> Result<AccessCredential> {
        match self.refresh().await {
            Ok(credential) => Ok(credential),
            Err(refresh_err) if self.has_login() => {
                warn!(account = %self.account, error = %refresh_err, "refresh failed, trying login fallback");
                self.login().await
            }
            Err(refresh_err) => Err(refresh_err),
        }
    }

    fn apply(&mut self, credential: AccessCredential) {
        self.client.set_bearer(credential.access.clone());
        self.current = Some(credential);
    }
}
