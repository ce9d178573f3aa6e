//! Job registry for in-flight asynchronous calls.
//!
//! Each job pairs a [`JobId`] with a one-shot sender. The registry owns the
//! sender until the job is resolved, rejected, removed or drained; the caller
//! holds the matching [`PendingJob`].
//!
//! ```text
//! create()  ──► PENDING ──► resolve() ──► RESOLVED  (entry removed)
//!                  │    └──► reject()  ──► REJECTED  (entry removed)
//!                  └──────► drain_with_error() ──► ABANDONED
//! ```
//!
//! Completing an id that is no longer present is a no-op: the transport gives
//! no idempotence guarantee, so late or duplicate deliveries are expected.

use crate::codec::MethodError;
use crate::{CourierError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

/// Identifier of one outstanding asynchronous call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Final outcome of a job.
pub type JobOutcome = std::result::Result<Value, MethodError>;

/// Caller side of a job.
///
/// Resolves to `None` if the registry was dropped without completing the job.
#[derive(Debug)]
pub struct PendingJob {
    job_id: JobId,
    receiver: oneshot::Receiver<JobOutcome>,
}

impl PendingJob {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl Future for PendingJob {
    type Output = Option<JobOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|outcome| outcome.ok())
    }
}

/// Map from job id to the pending-result sender.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, oneshot::Sender<JobOutcome>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, oneshot::Sender<JobOutcome>>> {
        // Critical sections never panic while holding the lock.
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new job under a freshly generated id.
    pub fn create(&self) -> Result<(JobId, PendingJob)> {
        self.create_with_id(JobId::generate())
    }

    pub(crate) fn create_with_id(&self, job_id: JobId) -> Result<(JobId, PendingJob)> {
        let mut jobs = self.jobs();
        if jobs.contains_key(&job_id) {
            error!(job_id = %job_id, "Job id collision with a live job");
            return Err(CourierError::JobIdCollision(job_id));
        }

        let (sender, receiver) = oneshot::channel();
        jobs.insert(job_id.clone(), sender);
        debug!(job_id = %job_id, live_jobs = jobs.len(), "Job created");

        Ok((
            job_id.clone(),
            PendingJob {
                job_id,
                receiver,
            },
        ))
    }

    /// Complete a job successfully. Returns `false` if the id is not live.
    pub fn resolve(&self, job_id: &JobId, value: Value) -> bool {
        self.complete(job_id, Ok(value))
    }

    /// Complete a job with a failure. Returns `false` if the id is not live.
    pub fn reject(&self, job_id: &JobId, error: MethodError) -> bool {
        self.complete(job_id, Err(error))
    }

    fn complete(&self, job_id: &JobId, outcome: JobOutcome) -> bool {
        let Some(sender) = self.jobs().remove(job_id) else {
            return false;
        };

        if sender.send(outcome).is_err() {
            debug!(job_id = %job_id, "Job completed after its caller stopped waiting");
        }
        true
    }

    /// Reject every live job with the same failure and clear the registry.
    ///
    /// Returns the number of jobs that were abandoned.
    pub fn drain_with_error(&self, code: &str, message: &str) -> usize {
        let drained: Vec<_> = self.jobs().drain().collect();
        let count = drained.len();

        for (job_id, sender) in drained {
            let error = MethodError::new(code, Some(message.to_string()), None);
            if sender.send(Err(error)).is_err() {
                debug!(job_id = %job_id, "Drained job had no waiting caller");
            }
        }

        if count > 0 {
            debug!(count, code, "Drained outstanding jobs");
        }
        count
    }

    /// Drop a job without completing it.
    pub fn remove(&self, job_id: &JobId) -> bool {
        self.jobs().remove(job_id).is_some()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.jobs().contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }
}
