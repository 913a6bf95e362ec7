//! Registry of import phases running in this process
//!
//! Keeps a redelivered queue message from running a job that is already being
//! processed here, and carries a cancellation token per job so a cancel request is
//! seen at the very next checkpoint. RAII cleanup via `JobGuard`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::ImportPhase;

struct JobEntry {
    token: CancellationToken,
    phase: ImportPhase,
}

/// RAII guard that removes the job from the registry when dropped.
/// Must be kept alive for the duration of phase processing.
pub struct JobGuard {
    job_id: Uuid,
    token: CancellationToken,
    registry: ActiveJobs,
}

impl JobGuard {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.jobs.lock().remove(&self.job_id);
    }
}

#[derive(Clone, Default)]
pub struct ActiveJobs {
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
}

impl ActiveJobs {
    /// Claim a job for `phase`. Returns `None` when the job is already running here.
    pub fn register(&self, job_id: Uuid, phase: ImportPhase) -> Option<JobGuard> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job_id) {
            return None;
        }
        let token = CancellationToken::new();
        jobs.insert(
            job_id,
            JobEntry {
                token: token.clone(),
                phase,
            },
        );
        Some(JobGuard {
            job_id,
            token,
            registry: self.clone(),
        })
    }

    /// Signal cancellation to a running job. Returns false when the job is not running here.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        match self.jobs.lock().get(job_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, job_id: &Uuid) -> bool {
        self.jobs.lock().contains_key(job_id)
    }

    /// Phase currently running for the job, if any
    pub fn running_phase(&self, job_id: &Uuid) -> Option<ImportPhase> {
        self.jobs.lock().get(job_id).map(|e| e.phase)
    }
}
