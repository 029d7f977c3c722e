//! [`JobSync`] implementation: list, fetch, verify, dispatch

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use metrics::counter;
use titan_api::ApiClient;
use titan_stream::{JobReport, JobSync, SyncOutcome};
use tracing::{debug, info, warn};

use crate::descriptor::{JobDescriptor, list_jobs};
use crate::error::{Error, Result};
use crate::executor::JobExecutor;
use crate::verify::verify_script;

/// One per account. Counts from the most recent sync feed the keepalive
/// job report.
pub struct JobSyncer {
    account: String,
    executor: Arc<dyn JobExecutor>,
    listed: AtomicU32,
    verified: AtomicU32,
}

impl JobSyncer {
    pub fn new(account: impl Into<String>, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            account: account.into(),
            executor,
            listed: AtomicU32::new(0),
            verified: AtomicU32::new(0),
        }
    }

    /// List jobs and dispatch every one whose script verifies.
    ///
    /// Per-job failures (fetch or integrity) are logged and skipped. A
    /// failed listing is an error, and so is an auth rejection on any
    /// fetch: the remaining jobs are not tried with a rejected credential.
    pub async fn sync_once(&self, client: &ApiClient) -> Result<JobReport> {
        let jobs = list_jobs(client).await?;
        info!(account = %self.account, jobs = jobs.len(), "loaded jobs");

        let mut verified = 0u32;
        for job in &jobs {
            match self.load(client, job.clone()).await {
                Ok(()) => verified += 1,
                Err(e @ Error::Unauthorized(_)) => return Err(e),
                Err(e @ Error::Integrity { .. }) => {
                    counter!("titan_jobs_rejected_total").increment(1);
                    warn!(account = %self.account, job_id = %job.id, error = %e, "discarding job");
                }
                Err(e) => {
                    warn!(account = %self.account, job_id = %job.id, error = %e, "job script unavailable");
                }
            }
        }

        let report = JobReport {
            config_count: u32::try_from(jobs.len()).unwrap_or(u32::MAX),
            job_count: verified,
        };
        self.listed.store(report.config_count, Ordering::Relaxed);
        self.verified.store(report.job_count, Ordering::Relaxed);
        Ok(report)
    }

    async fn load(&self, client: &ApiClient, job: JobDescriptor) -> Result<()> {
        let url = if job.script_url.starts_with("http://") || job.script_url.starts_with("https://") {
            job.script_url.clone()
        } else {
            client
                .url(&job.script_url)
                .map_err(|e| Error::Fetch(e.to_string()))?
                .to_string()
        };
        let script = client
            .fetch_bytes(&url)
            .await
            .map_err(|e| Error::from_api(e, Error::Fetch))?;
        debug!(account = %self.account, job_id = %job.id, bytes = script.len(), "fetched job script");

        let verified = verify_script(job, script)?;
        counter!("titan_jobs_verified_total").increment(1);
        self.executor.dispatch(verified);
        Ok(())
    }
}

impl JobSync for JobSyncer {
    fn sync(self: Arc<Self>, client: ApiClient) -> Pin<Box<dyn Future<Output = SyncOutcome> + Send>> {
        Box::pin(async move {
            match self.sync_once(&client).await {
                Ok(_) => SyncOutcome::Done,
                Err(e @ Error::Unauthorized(_)) => {
                    warn!(account = %self.account, error = %e, "job sync unauthorized");
                    SyncOutcome::Unauthorized
                }
                Err(e) => {
                    warn!(account = %self.account, error = %e, "job sync failed");
                    SyncOutcome::Done
                }
            }
        })
    }

    fn report(&self) -> JobReport {
        JobReport {
            config_count: self.listed.load(Ordering::Relaxed),
            job_count: self.verified.load(Ordering::Relaxed),
        }
    }
}
