//! Account supervisor
//!
//! Launches every account pipeline as its own task (staggered or
//! sequential), keeps failures isolated, and drains on shutdown.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::RngExt;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{LaunchMode, SupervisorConfig};
use crate::error::AccountError;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchPlan {
    pub mode: LaunchMode,
    pub stagger: Duration,
    pub sequential_min: Duration,
    pub sequential_max: Duration,
}

impl LaunchPlan {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            mode: config.launch,
            stagger: Duration::from_secs(config.stagger_secs),
            sequential_min: Duration::from_secs(config.sequential_min_delay_secs),
            sequential_max: Duration::from_secs(config.sequential_max_delay_secs),
        }
    }

    /// Staggered mode: account `index` starts `index * stagger` after launch.
    pub fn stagger_delay(&self, index: usize) -> Duration {
        self.stagger
            .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX))
    }

    /// Sequential mode: uniformly random gap in `[min, max]`.
    pub fn sequential_gap(&self) -> Duration {
        let min = self.sequential_min.as_millis() as u64;
        let max = (self.sequential_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub launched: usize,
    pub failed: usize,
    pub stopped: usize,
}

enum Outcome {
    NotLaunched,
    Stopped,
    Failed,
}

impl Summary {
    fn record(&mut self, joined: Result<Outcome, JoinError>) {
        match joined {
            Ok(Outcome::NotLaunched) => {}
            Ok(Outcome::Stopped) => self.stopped += 1,
            Ok(Outcome::Failed) => self.failed += 1,
            Err(e) => {
                error!(error = %e, "account task panicked");
                metrics::record_account_failure("panic");
                self.failed += 1;
            }
        }
    }
}

/// Run one pipeline per `(label, input)` until all finish or `cancel` fires,
/// then give them `drain` to wind down.
///
/// A failed pipeline is logged and counted; it never affects the others.
pub async fn supervise<T, F, Fut>(
    accounts: Vec<(String, T)>,
    plan: &LaunchPlan,
    cancel: &CancellationToken,
    drain: Duration,
    pipeline: F,
) -> Summary
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), AccountError>> + Send + 'static,
{
    let total = accounts.len();
    let launched = Arc::new(AtomicUsize::new(0));
    let mut tasks = JoinSet::new();
    info!(accounts = total, mode = ?plan.mode, "launching accounts");

    for (index, (label, input)) in accounts.into_iter().enumerate() {
        let delay = match plan.mode {
            LaunchMode::Staggered => plan.stagger_delay(index),
            LaunchMode::Sequential => {
                if index > 0 {
                    let gap = plan.sequential_gap();
                    info!(next = %label, delay_ms = gap.as_millis() as u64, "waiting before next account");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(gap) => {}
                    }
                }
                Duration::ZERO
            }
        };

        let span = info_span!("account", account = %label);
        let task = launch(delay, pipeline(input), cancel.clone(), launched.clone());
        tasks.spawn(task.instrument(span));
    }

    let mut summary = Summary::default();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            joined = tasks.join_next() => match joined {
                Some(joined) => summary.record(joined),
                None => {
                    summary.launched = launched.load(Ordering::SeqCst);
                    return summary;
                }
            },
        }
    }

    info!(running = tasks.len(), drain_timeout_secs = drain.as_secs(), "draining account tasks");
    let drained = tokio::time::timeout(drain, async {
        while let Some(joined) = tasks.join_next().await {
            summary.record(joined);
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = tasks.len(), "drain timeout exceeded, aborting account tasks");
        summary.stopped += tasks.len();
        tasks.abort_all();
    }

    summary.launched = launched.load(Ordering::SeqCst);
    summary
}

async fn launch<Fut>(
    delay: Duration,
    pipeline: Fut,
    cancel: CancellationToken,
    launched: Arc<AtomicUsize>,
) -> Outcome
where
    Fut: Future<Output = Result<(), AccountError>>,
{
    if !delay.is_zero() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::NotLaunched,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    if cancel.is_cancelled() {
        return Outcome::NotLaunched;
    }

    launched.fetch_add(1, Ordering::SeqCst);
    metrics::record_launch();
    info!("account launched");

    match pipeline.await {
        Ok(()) => {
            info!("account stopped");
            Outcome::Stopped
        }
        Err(e) => {
            metrics::record_account_failure(e.reason());
            error!(reason = e.reason(), error = %e, "account failed, other accounts continue");
            Outcome::Failed
        }
    }
}
