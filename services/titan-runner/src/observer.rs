//! Bridges stream session events to status, metrics and the account store

use std::sync::Arc;
use std::time::Duration;

use titan_api::{AccountStore, CredentialManager, StoredAccount};
use titan_endpoints::Endpoint;
use titan_stream::{PointsUpdate, StreamObserver};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::status::AccountStatus;

pub struct RunnerObserver {
    account: String,
    status: watch::Sender<AccountStatus>,
    store: Option<Arc<AccountStore>>,
}

impl RunnerObserver {
    pub fn new(
        account: String,
        status: watch::Sender<AccountStatus>,
        store: Option<Arc<AccountStore>>,
    ) -> Self {
        Self {
            account,
            status,
            store,
        }
    }
}

impl StreamObserver for RunnerObserver {
    fn connected(&self, endpoint: &Endpoint) {
        self.status.send_replace(AccountStatus::Connected {
            endpoint: endpoint.to_string(),
        });
    }

    fn reconnecting(&self, attempt: u32, _delay: Duration) {
        self.status
            .send_replace(AccountStatus::Reconnecting { attempt });
    }

    fn points_updated(&self, update: &PointsUpdate) {
        info!(
            account = %self.account,
            today_points = ?update.today_points,
            total_points = ?update.total_points,
            "points updated"
        );
        if let Some(total) = update.total_points {
            metrics::set_points(&self.account, total);
        }
    }

    fn user_info(&self, info: &serde_json::Value) {
        debug!(account = %self.account, info = %info, "user info");
    }

    /// Persist off the session's task; a slow disk must not stall the stream.
    fn reauthenticated(&self, credentials: &CredentialManager) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = StoredAccount::from_manager(credentials);
        let account = self.account.clone();
        tokio::spawn(async move {
            if let Err(e) = store.record(&account, snapshot).await {
                warn!(account = %account, error = %e, "failed to persist refreshed credentials");
            }
        });
    }
}
