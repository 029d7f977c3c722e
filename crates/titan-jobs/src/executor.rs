//! Where verified jobs go

use std::sync::Mutex;

use tracing::info;

use crate::verify::VerifiedJob;

/// Receives verified jobs. Must not block; long work belongs on a task.
pub trait JobExecutor: Send + Sync {
    fn dispatch(&self, job: VerifiedJob);
}

/// Records verified jobs and logs them. Never executes scripts.
#[derive(Debug, Default)]
pub struct LogOnlyExecutor {
    seen: Mutex<Vec<String>>,
}

impl LogOnlyExecutor {
    /// IDs of every job dispatched so far.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl JobExecutor for LogOnlyExecutor {
    fn dispatch(&self, job: VerifiedJob) {
        info!(
            job_id = %job.descriptor.id,
            script_bytes = job.script.len(),
            "job verified (not executed)"
        );
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(job.descriptor.id);
        }
    }
}
