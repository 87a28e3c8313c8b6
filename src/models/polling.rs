use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub max_attempts: u32,
    /// Retries for a single failed status request before the job is given up.
    pub poll_retries: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            max_attempts: 120,
            poll_retries: 2,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// One observation of a remote job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub output_url: Option<String>,
    pub error: Option<String>,
}

impl JobSnapshot {
    pub fn running() -> Self {
        Self {
            status: JobStatus::Running,
            output_url: None,
            error: None,
        }
    }

    pub fn succeeded(url: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Succeeded,
            output_url: Some(url.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            output_url: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsyncJob {
    pub provider: String,
    pub job_id: String,
    pub status: JobStatus,
    pub poll_interval: Duration,
    pub attempts_so_far: u32,
    pub max_attempts: u32,
}

impl AsyncJob {
    pub fn new(provider: impl Into<String>, job_id: impl Into<String>, config: &PollingConfig) -> Self {
        Self {
            provider: provider.into(),
            job_id: job_id.into(),
            status: JobStatus::Queued,
            poll_interval: config.interval(),
            attempts_so_far: 0,
            max_attempts: config.max_attempts,
        }
    }

    /// Sleeps, polls, repeats until the job reaches a terminal status.
    /// Returns the output URL of a succeeded job. A failed job is a
    /// transient provider failure; running out of attempts is `Timeout`.
    pub async fn wait<F, Fut>(&mut self, cancel: &CancellationToken, mut poll: F) -> Result<String>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<JobSnapshot>>,
    {
        while self.attempts_so_far < self.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Polling for {} job {} cancelled", self.provider, self.job_id);
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let snapshot = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                snapshot = poll(self.job_id.clone()) => snapshot?,
            };
            self.attempts_so_far += 1;
            self.status = snapshot.status;

            debug!(
                "{} job {} poll {}/{}: {:?}",
                self.provider, self.job_id, self.attempts_so_far, self.max_attempts, snapshot.status
            );

            match snapshot.status {
                JobStatus::Succeeded => {
                    return snapshot.output_url.ok_or_else(|| {
                        Error::upstream_format(&self.provider, format!("job {} succeeded without output", self.job_id))
                    });
                }
                JobStatus::Failed => {
                    let reason = snapshot.error.unwrap_or_else(|| "unknown error".to_string());
                    warn!("{} job {} failed: {}", self.provider, self.job_id, reason);
                    return Err(Error::transient(&self.provider, format!("job {} failed: {}", self.job_id, reason)));
                }
                JobStatus::Queued | JobStatus::Running => {}
            }
        }

        warn!(
            "{} job {} still not terminal after {} polls",
            self.provider, self.job_id, self.attempts_so_far
        );
        Err(Error::Timeout {
            provider: self.provider.clone(),
            attempts: self.attempts_so_far,
        })
    }
}

/// How long cancelled work may keep running to release remote jobs.
pub const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Drives `work` to completion. Once `cancel` fires, `work` keeps running
/// for up to `grace` so it can observe the token itself and clean up
/// (e.g. cancel a remote prediction) before it is dropped. The result after
/// cancellation is always `Cancelled`.
pub async fn run_cancellable<T, F>(cancel: &CancellationToken, grace: Duration, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let mut work = std::pin::pin!(work);
    let finished = tokio::select! {
        outcome = &mut work => Some(outcome),
        _ = cancel.cancelled() => None,
    };
    if let Some(outcome) = finished {
        return outcome;
    }

    if tokio::time::timeout(grace, work).await.is_err() {
        warn!("Cancelled work did not wind down within {:?}, dropping it", grace);
    }
    Err(Error::Cancelled)
}
