//! Owned per-account state and the bootstrap → stream pipeline
//!
//! An [`Account`] is moved into its task and never shared: credentials,
//! endpoint cursor and device identity all live here. The only things
//! accounts have in common are in [`Shared`], which is read-only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use common::Secret;
use reqwest::Url;
use titan_api::{
    AccountStore, ApiClient, CredentialManager, DeviceDescriptor, HttpSettings, LoginCredentials,
    TrafficCounters, build_http_client,
};
use titan_endpoints::{Endpoint, EndpointPool, EndpointStrategy, HarborDiscovery, Prober};
use titan_jobs::{JobSyncer, LogOnlyExecutor};
use titan_stream::{ReconnectPolicy, SessionConfig, SessionContext, StreamSession};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bootstrap::bootstrap;
use crate::config::{Config, redact_userinfo};
use crate::error::AccountError;
use crate::metrics;
use crate::observer::RunnerObserver;
use crate::status::AccountStatus;

/// Read-only inputs every account pipeline uses.
pub struct Shared {
    pub endpoints: Vec<Endpoint>,
    pub strategy: EndpointStrategy,
    pub prober: Prober,
    pub store: Option<Arc<AccountStore>>,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub http_timeout: Duration,
    /// Per-account copies get their proxy filled in
    pub session: SessionConfig,
}

impl Shared {
    pub fn from_config(config: &Config, store: Option<Arc<AccountStore>>) -> anyhow::Result<Self> {
        let endpoints = config.endpoints()?;
        let probe_timeout = Duration::from_secs(
            config
                .discovery
                .as_ref()
                .map_or(5, |d| d.probe_timeout_secs),
        );

        // Probes and discovery never go through an account proxy
        let http = build_http_client(&HttpSettings {
            user_agent: config.user_agent.clone(),
            headers: config.header_template(),
            proxy: None,
            timeout: probe_timeout,
        })
        .context("building probe client")?;

        let strategy = match &config.discovery {
            Some(discovery) => {
                let urls = discovery
                    .bootstrap_urls
                    .iter()
                    .map(|u| Url::parse(u).with_context(|| format!("invalid bootstrap url {u}")))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                EndpointStrategy::DiscoveryFallback {
                    discovery: HarborDiscovery::new(http.clone(), urls),
                }
            }
            None => EndpointStrategy::StaticPool,
        };

        let session = SessionConfig {
            keepalive: config.keepalive(),
            policy: ReconnectPolicy::new(
                Duration::from_secs(config.stream.reconnect_base_secs),
                config.stream.max_reconnect_attempts,
            ),
            user_info_poll: config.user_info_poll(),
            max_auth_retries: config.stream.max_auth_retries,
            user_agent: config.user_agent.clone(),
            ..SessionConfig::default()
        };

        Ok(Self {
            endpoints,
            strategy,
            prober: Prober::new(http, probe_timeout),
            store,
            user_agent: config.user_agent.clone(),
            headers: config.header_template(),
            http_timeout: Duration::from_secs(30),
            session,
        })
    }
}

/// What configuration says about one account.
#[derive(Debug, Clone)]
pub struct AccountSpec {
    pub label: String,
    pub refresh: Secret<String>,
    pub login: Option<LoginCredentials>,
    pub proxy: Option<String>,
}

impl AccountSpec {
    pub fn all_from_config(config: &Config) -> Vec<Self> {
        config
            .accounts
            .iter()
            .enumerate()
            .map(|(index, account)| {
                let login = match (&account.email, &account.password) {
                    (Some(email), Some(password)) => Some(LoginCredentials {
                        email: email.clone(),
                        password: password.clone(),
                    }),
                    _ => None,
                };
                AccountSpec {
                    label: config.label_for(index),
                    refresh: account.refresh_token.clone(),
                    login,
                    proxy: config.proxy_for(index).map(str::to_owned),
                }
            })
            .collect()
    }
}

/// Whole pipeline for one account, from configuration to shutdown.
pub async fn run_account(
    spec: AccountSpec,
    shared: Arc<Shared>,
    status: watch::Sender<AccountStatus>,
    cancel: CancellationToken,
) -> Result<(), AccountError> {
    match Account::prepare(spec, &shared).await {
        Ok(account) => account.run(&shared, status, cancel).await,
        Err(e) => {
            status.send_replace(AccountStatus::Failed {
                reason: e.to_string(),
            });
            Err(e)
        }
    }
}

pub struct Account {
    pub label: String,
    pub credentials: CredentialManager,
    pub pool: EndpointPool,
    pub device: DeviceDescriptor,
    pub proxy: Option<Url>,
}

impl Account {
    /// Build the account's HTTP channel, pool cursor and device identity.
    ///
    /// A refresh credential from the store (obtained by an earlier login)
    /// takes precedence over the configured one.
    pub async fn prepare(spec: AccountSpec, shared: &Shared) -> Result<Self, AccountError> {
        let AccountSpec {
            label,
            mut refresh,
            login,
            proxy,
        } = spec;

        if let Some(store) = &shared.store {
            if let Some(stored) = store.get(&label).await {
                info!(account = %label, "resuming from stored refresh credential");
                refresh = Secret::new(stored.refresh);
            }
        }

        let proxy_url = proxy
            .as_deref()
            .map(|p| {
                Url::parse(p).map_err(|e| {
                    AccountError::BootstrapFailed(format!(
                        "invalid proxy {}: {e}",
                        redact_userinfo(p)
                    ))
                })
            })
            .transpose()?;

        let http = build_http_client(&HttpSettings {
            user_agent: shared.user_agent.clone(),
            headers: shared.headers.clone(),
            proxy,
            timeout: shared.http_timeout,
        })
        .map_err(|e| AccountError::BootstrapFailed(e.to_string()))?;

        let pool = EndpointPool::new(shared.endpoints.clone())?;
        let client = ApiClient::new(
            http,
            pool.current().api().clone(),
            Arc::new(TrafficCounters::new()),
        );
        let device = DeviceDescriptor::generate();
        info!(
            account = %label,
            device_id = %device.device_id,
            proxied = proxy_url.is_some(),
            "account prepared"
        );

        Ok(Self {
            credentials: CredentialManager::new(label.clone(), refresh, login, client),
            label,
            pool,
            device,
            proxy: proxy_url,
        })
    }

    /// Bootstrap, then hold the stream session until shutdown or a
    /// terminal failure. The final status is published either way.
    pub async fn run(
        mut self,
        shared: &Shared,
        status: watch::Sender<AccountStatus>,
        cancel: CancellationToken,
    ) -> Result<(), AccountError> {
        let result = self.pipeline(shared, &status, &cancel).await;
        status.send_replace(match &result {
            Ok(()) => AccountStatus::Stopped,
            Err(e) => AccountStatus::Failed {
                reason: e.to_string(),
            },
        });
        result
    }

    async fn pipeline(
        &mut self,
        shared: &Shared,
        status: &watch::Sender<AccountStatus>,
        cancel: &CancellationToken,
    ) -> Result<(), AccountError> {
        status.send_replace(AccountStatus::Bootstrapping);
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            outcome = bootstrap(self, shared) => outcome,
        };
        let elapsed = started.elapsed().as_secs_f64();
        metrics::record_bootstrap(if outcome.is_ok() { "ok" } else { "failed" }, elapsed);
        outcome?;

        let mut config = shared.session.clone();
        config.proxy = self.proxy.clone();
        let jobs = Arc::new(JobSyncer::new(
            self.label.clone(),
            Arc::new(LogOnlyExecutor::default()),
        ));
        let observer = Arc::new(RunnerObserver::new(
            self.label.clone(),
            status.clone(),
            shared.store.clone(),
        ));

        let mut session = StreamSession::new(config, jobs, observer);
        let ctx = SessionContext {
            credentials: &mut self.credentials,
            pool: &mut self.pool,
            device_id: &self.device.device_id,
        };
        session.run(ctx, cancel).await?;
        Ok(())
    }
}
