//! Collaborator seams: job sync and session observer
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn JobSync>`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use titan_api::{ApiClient, CredentialManager};
use titan_endpoints::Endpoint;

use crate::protocol::{JobReport, PointsUpdate};

/// How a job sync ended, as far as the session is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Finished, or failed for a reason the session does not act on
    Done,
    /// The node rejected the access credential; the session refreshes it
    /// before anything uses it again
    Unauthorized,
}

/// Called when the node signals that the job set changed.
///
/// The session spawns the returned future off its read loop, so a slow
/// sync does not hold up keepalive. The outcome comes back to the loop.
pub trait JobSync: Send + Sync {
    /// `client` is a snapshot of the account's API channel (current base
    /// and bearer credential).
    fn sync(self: Arc<Self>, client: ApiClient) -> Pin<Box<dyn Future<Output = SyncOutcome> + Send>>;

    /// Counts reported in each keepalive PING.
    fn report(&self) -> JobReport;
}

/// Job sync that does nothing and reports zero jobs.
#[derive(Debug, Default)]
pub struct NoJobs;

impl JobSync for NoJobs {
    fn sync(self: Arc<Self>, _client: ApiClient) -> Pin<Box<dyn Future<Output = SyncOutcome> + Send>> {
        Box::pin(async { SyncOutcome::Done })
    }

    fn report(&self) -> JobReport {
        JobReport::default()
    }
}

/// Session lifecycle notifications. Purely observational: nothing an
/// observer does can change session state.
pub trait StreamObserver: Send + Sync {
    fn connected(&self, _endpoint: &Endpoint) {}

    fn disconnected(&self) {}

    fn reconnecting(&self, _attempt: u32, _delay: Duration) {}

    fn points_updated(&self, _update: &PointsUpdate) {}

    fn user_info(&self, _info: &serde_json::Value) {}

    /// The session refreshed (or re-logged) the account's credentials.
    fn reauthenticated(&self, _credentials: &CredentialManager) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl StreamObserver for NoopObserver {}
