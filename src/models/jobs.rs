use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::polling::{run_cancellable, CANCEL_GRACE};
use crate::models::provider::CapabilityResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackgroundJobStatus {
    Pending,
    Running,
    Succeeded { media_url: String, provider: String },
    Failed { message: String },
    Cancelled,
}

impl BackgroundJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackgroundJobStatus::Succeeded { .. } | BackgroundJobStatus::Failed { .. } | BackgroundJobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: Uuid,
    pub kind: String,
    pub status: BackgroundJobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct TrackedJob {
    record: BackgroundJob,
    cancel: CancellationToken,
}

/// Detached generation tasks with a status record callers can poll.
/// Records live for the lifetime of the process.
#[derive(Clone, Default)]
pub struct BackgroundJobs {
    jobs: Arc<RwLock<HashMap<Uuid, TrackedJob>>>,
}

impl BackgroundJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `task` on the runtime and returns its job id right away. The
    /// task receives the job's cancellation token and is given a grace
    /// period to wind down after `cancel`.
    pub fn spawn<F, Fut>(&self, kind: &str, task: F) -> Uuid
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<CapabilityResult>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let now = Utc::now();

        self.jobs.write().insert(
            id,
            TrackedJob {
                record: BackgroundJob {
                    id,
                    kind: kind.to_string(),
                    status: BackgroundJobStatus::Pending,
                    created_at: now,
                    updated_at: now,
                },
                cancel: cancel.clone(),
            },
        );

        let future = task(cancel.clone());
        let jobs = self.clone();
        let kind = kind.to_string();

        tokio::spawn(async move {
            jobs.set_status(id, BackgroundJobStatus::Running);
            debug!("Background {} job {} running", kind, id);

            let status = match run_cancellable(&cancel, CANCEL_GRACE, future).await {
                Ok(result) => match result.media_url() {
                    Some(url) => BackgroundJobStatus::Succeeded {
                        media_url: url.to_string(),
                        provider: result.provider_used.clone(),
                    },
                    None => BackgroundJobStatus::Failed {
                        message: "job finished without a media artifact".to_string(),
                    },
                },
                Err(Error::Cancelled) => BackgroundJobStatus::Cancelled,
                Err(e) => BackgroundJobStatus::Failed { message: e.to_string() },
            };

            match &status {
                BackgroundJobStatus::Succeeded { provider, .. } => {
                    info!("Background {} job {} succeeded via {}", kind, id, provider)
                }
                BackgroundJobStatus::Failed { message } => {
                    warn!("Background {} job {} failed: {}", kind, id, message)
                }
                _ => debug!("Background {} job {} finished: {:?}", kind, id, status),
            }
            jobs.set_status(id, status);
        });

        id
    }

    pub fn get(&self, id: Uuid) -> Option<BackgroundJob> {
        self.jobs.read().get(&id).map(|job| job.record.clone())
    }

    pub fn list(&self) -> Vec<BackgroundJob> {
        let mut jobs: Vec<BackgroundJob> = self.jobs.read().values().map(|job| job.record.clone()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Returns false when the job is unknown or already finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&id) else {
            return false;
        };
        if job.record.status.is_terminal() {
            return false;
        }

        job.cancel.cancel();
        job.record.status = BackgroundJobStatus::Cancelled;
        job.record.updated_at = Utc::now();
        info!("Cancelled background {} job {}", job.record.kind, id);
        true
    }

    // The first terminal status wins.
    fn set_status(&self, id: Uuid, status: BackgroundJobStatus) {
        if let Some(job) = self.jobs.write().get_mut(&id) {
            if job.record.status.is_terminal() {
                return;
            }
            job.record.status = status;
            job.record.updated_at = Utc::now();
        }
    }
}
