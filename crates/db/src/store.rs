//! The record store seam between the pipeline and persistence.

use async_trait::async_trait;
use brandkit_core::build_job::{BuildJob, BuildJobFilter, BuildJobPatch, BuildStatus};
use brandkit_core::types::JobId;

use crate::repositories::BuildJobRepo;
use crate::DbPool;

/// Errors surfaced by a [`JobStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Build job {0} not found")]
    NotFound(JobId),

    /// A unique constraint rejected the write (e.g. a second active job).
    #[error("Conflicting build job record: {0}")]
    Conflict(String),

    /// A row could not be mapped back into domain types.
    #[error("Corrupt build job record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    /// A patch whose status the record's current status does not admit.
    pub fn illegal_transition(id: JobId, from: BuildStatus, to: Option<BuildStatus>) -> Self {
        let to = to.map_or("unchanged", BuildStatus::as_str);
        StoreError::Conflict(format!("build job {id} cannot move from {from} to {to}"))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // PostgreSQL unique constraint violation: error code 23505
            if db_err.code().as_deref() == Some("23505") {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                return StoreError::Conflict(constraint);
            }
        }
        StoreError::Database(err)
    }
}

/// Persistence operations the build pipeline depends on.
///
/// Implementations must be safe to share across the request handlers and
/// the single active build worker.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &BuildJob) -> Result<(), StoreError>;

    /// Apply `patch` and return the updated record.
    ///
    /// Fails with [`StoreError::Conflict`] when the record's status does not
    /// admit the patch's status (see [`BuildStatus::admits`]).
    async fn update(&self, id: JobId, patch: &BuildJobPatch) -> Result<BuildJob, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<BuildJob>, StoreError>;

    /// Matching records, newest first.
    async fn list(&self, filter: &BuildJobFilter) -> Result<Vec<BuildJob>, StoreError>;

    /// Remove matching records and return how many were deleted.
    async fn delete(&self, filter: &BuildJobFilter) -> Result<u64, StoreError>;

    /// Cheap reachability probe for health checks.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// [`JobStore`] backed by the `build_jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &BuildJob) -> Result<(), StoreError> {
        BuildJobRepo::insert(&self.pool, job).await?;
        Ok(())
    }

    async fn update(&self, id: JobId, patch: &BuildJobPatch) -> Result<BuildJob, StoreError> {
        if let Some(row) = BuildJobRepo::update(&self.pool, id, patch).await? {
            return BuildJob::try_from(row);
        }
        // No row matched: either the id is unknown or its status refused the patch.
        match BuildJobRepo::find_by_id(&self.pool, id).await? {
            Some(row) => {
                let current = BuildJob::try_from(row)?;
                Err(StoreError::illegal_transition(id, current.status, patch.status))
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<BuildJob>, StoreError> {
        BuildJobRepo::find_by_id(&self.pool, id)
            .await?
            .map(BuildJob::try_from)
            .transpose()
    }

    async fn list(&self, filter: &BuildJobFilter) -> Result<Vec<BuildJob>, StoreError> {
        BuildJobRepo::list(&self.pool, filter)
            .await?
            .into_iter()
            .map(BuildJob::try_from)
            .collect()
    }

    async fn delete(&self, filter: &BuildJobFilter) -> Result<u64, StoreError> {
        Ok(BuildJobRepo::delete(&self.pool, filter).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        crate::health_check(&self.pool).await?;
        Ok(())
    }
}
