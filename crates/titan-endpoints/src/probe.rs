//! Lightweight liveness check
//!
//! A GET on the API base with a short timeout. Any HTTP answer that is not
//! a gateway/server failure counts as alive: a 404 or 401 on `/` still
//! proves the node is up.

use std::time::Duration;

use titan_api::{StatusClass, classify_status};
use tracing::debug;

use crate::endpoint::Endpoint;

#[derive(Debug, Clone)]
pub struct Prober {
    http: reqwest::Client,
    timeout: Duration,
}

impl Prober {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    pub async fn is_alive(&self, endpoint: &Endpoint) -> bool {
        let response = self
            .http
            .get(endpoint.api().clone())
            .timeout(self.timeout)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let alive = classify_status(status) != StatusClass::Transient;
                debug!(endpoint = %endpoint, status, alive, "probe answered");
                alive
            }
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;

    /// Serve `app` on an ephemeral port; returns an endpoint pointing at it.
    pub(crate) async fn serve(app: Router) -> Endpoint {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Endpoint::new(&format!("http://{addr}"), &format!("ws://{addr}")).unwrap()
    }

    /// An endpoint whose port refuses connections.
    pub(crate) async fn dead_endpoint() -> Endpoint {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Endpoint::new(&format!("http://{addr}"), &format!("ws://{addr}")).unwrap()
    }

    pub(crate) fn prober() -> Prober {
        Prober::new(reqwest::Client::new(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn answering_endpoint_is_alive() {
        let endpoint = serve(Router::new().route("/", get(|| async { "ok" }))).await;
        assert!(prober().is_alive(&endpoint).await);
    }

    #[tokio::test]
    async fn not_found_still_counts_as_alive() {
        let endpoint = serve(Router::new()).await;
        assert!(prober().is_alive(&endpoint).await);
    }

    #[tokio::test]
    async fn bad_gateway_is_not_alive() {
        let endpoint =
            serve(Router::new().route("/", get(|| async { StatusCode::BAD_GATEWAY }))).await;
        assert!(!prober().is_alive(&endpoint).await);
    }

    #[tokio::test]
    async fn refused_connection_is_not_alive() {
        let endpoint = dead_endpoint().await;
        assert!(!prober().is_alive(&endpoint).await);
    }
}
