//! Account status board and the `/health` + `/metrics` router
//!
//! Each account task owns a `watch::Sender<AccountStatus>`; the board only
//! holds receivers, so reading status never touches account state.

use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AccountStatus {
    /// Waiting for its launch slot
    Pending,
    Bootstrapping,
    Connected { endpoint: String },
    Reconnecting { attempt: u32 },
    Failed { reason: String },
    Stopped,
}

impl AccountStatus {
    /// Still running or about to.
    pub fn is_live(&self) -> bool {
        !matches!(self, AccountStatus::Failed { .. } | AccountStatus::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Every account connected
    Healthy,
    /// At least one account still live
    Degraded,
    /// No live account left
    Unhealthy,
}

impl Health {
    fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusBoard {
    accounts: Vec<(String, watch::Receiver<AccountStatus>)>,
}

impl StatusBoard {
    /// One channel per label, all starting `Pending`. Senders come back in
    /// label order.
    pub fn new(labels: &[String]) -> (Self, Vec<watch::Sender<AccountStatus>>) {
        let mut accounts = Vec::with_capacity(labels.len());
        let mut senders = Vec::with_capacity(labels.len());
        for label in labels {
            let (tx, rx) = watch::channel(AccountStatus::Pending);
            accounts.push((label.clone(), rx));
            senders.push(tx);
        }
        (Self { accounts }, senders)
    }

    pub fn snapshot(&self) -> Vec<(String, AccountStatus)> {
        self.accounts
            .iter()
            .map(|(label, rx)| (label.clone(), rx.borrow().clone()))
            .collect()
    }

    pub fn health(&self) -> Health {
        let snapshot = self.snapshot();
        if snapshot
            .iter()
            .all(|(_, s)| matches!(s, AccountStatus::Connected { .. }))
        {
            Health::Healthy
        } else if snapshot.iter().any(|(_, s)| s.is_live()) {
            Health::Degraded
        } else {
            Health::Unhealthy
        }
    }
}

/// Shared state for the status handlers
#[derive(Clone)]
pub struct AppState {
    pub board: StatusBoard,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the status router behind a concurrency limit.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// 200 while any account is live, 503 once none is.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.board.health();
    let accounts: serde_json::Map<String, serde_json::Value> = state
        .board
        .snapshot()
        .into_iter()
        .map(|(label, status)| {
            let value = serde_json::to_value(status).unwrap_or(serde_json::Value::Null);
            (label, value)
        })
        .collect();

    let status_code = match health {
        Health::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        Health::Healthy | Health::Degraded => StatusCode::OK,
    };
    let body = serde_json::json!({
        "status": health.as_str(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "accounts": accounts,
    });

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}
