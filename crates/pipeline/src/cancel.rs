//! Per-job cancellation tokens.
//!
//! A token is registered when a job is admitted, set by an external cancel
//! request, read by the worker at every stage boundary and by the process
//! watchdog, and removed once the worker has finished with the job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use brandkit_core::types::JobId;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the token for `job_id`.
    pub fn register(&self, job_id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(job_id, token.clone());
        token
    }

    /// Request cancellation. Returns `false` when no worker owns the job.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, job_id: JobId) -> bool {
        self.lock().get(&job_id).is_some_and(CancellationToken::is_cancelled)
    }

    /// Drop the token once the job is terminal.
    pub fn remove(&self, job_id: JobId) {
        self.lock().remove(&job_id);
    }

    /// Cancel every live job. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
