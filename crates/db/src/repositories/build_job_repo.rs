//! Repository for the `build_jobs` table.
//!
//! Status and mode values are bound through their lookup ids; no magic
//! numbers appear in the SQL.

use brandkit_core::build_job::{BuildJob, BuildJobFilter, BuildJobPatch, BuildStatus};
use brandkit_core::types::JobId;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::models::build_job::BuildJobRow;

/// Column list for `build_jobs` queries.
const COLUMNS: &str = "\
    id, brand_id, status_id, progress_percent, message, build_mode_id, \
    external_build_id, artifact_locator, artifact_path, log_path, \
    error_text, failure_kind, created_at, updated_at, completed_at";

/// Provides persistence operations for build jobs.
pub struct BuildJobRepo;

impl BuildJobRepo {
    /// Insert a new job row exactly as given.
    pub async fn insert(pool: &PgPool, job: &BuildJob) -> Result<BuildJobRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO build_jobs \
                (id, brand_id, status_id, progress_percent, message, build_mode_id, \
                 external_build_id, artifact_locator, artifact_path, log_path, \
                 error_text, failure_kind, created_at, updated_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, BuildJobRow>(&query)
            .bind(job.id)
            .bind(&job.brand_id)
            .bind(job.status.id())
            .bind(i16::from(job.progress_percent))
            .bind(&job.message)
            .bind(job.build_mode.id())
            .bind(&job.external_build_id)
            .bind(&job.artifact_locator)
            .bind(&job.artifact_path)
            .bind(&job.log_path)
            .bind(&job.error_text)
            .bind(job.failure_kind.map(|k| k.as_str()))
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.completed_at)
            .fetch_one(pool)
            .await
    }

    /// Apply a partial update. `NULL` parameters leave the column unchanged.
    ///
    /// A status change only applies to rows whose current status admits it.
    /// Returns `None` if no row has the given id or the row refused the
    /// status change.
    pub async fn update(
        pool: &PgPool,
        id: JobId,
        patch: &BuildJobPatch,
    ) -> Result<Option<BuildJobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE build_jobs SET \
                status_id = COALESCE($2, status_id), \
                progress_percent = COALESCE($3, progress_percent), \
                message = COALESCE($4, message), \
                external_build_id = COALESCE($5, external_build_id), \
                artifact_locator = COALESCE($6, artifact_locator), \
                artifact_path = COALESCE($7, artifact_path), \
                log_path = COALESCE($8, log_path), \
                error_text = COALESCE($9, error_text), \
                failure_kind = COALESCE($10, failure_kind), \
                completed_at = COALESCE($11, completed_at), \
                updated_at = NOW() \
             WHERE id = $1 \
               AND ($2::SMALLINT IS NULL OR status_id = ANY($12)) \
             RETURNING {COLUMNS}"
        );
        let admitting: Vec<i16> = patch
            .status
            .map(|next| BuildStatus::sources_admitting(next).into_iter().map(BuildStatus::id).collect())
            .unwrap_or_default();
        sqlx::query_as::<_, BuildJobRow>(&query)
            .bind(id)
            .bind(patch.status.map(|s| s.id()))
            .bind(patch.progress_percent.map(i16::from))
            .bind(&patch.message)
            .bind(&patch.external_build_id)
            .bind(&patch.artifact_locator)
            .bind(&patch.artifact_path)
            .bind(&patch.log_path)
            .bind(&patch.error_text)
            .bind(patch.failure_kind.map(|k| k.as_str()))
            .bind(patch.completed_at)
            .bind(admitting)
            .fetch_optional(pool)
            .await
    }

    /// Find a job by its id.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<BuildJobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM build_jobs WHERE id = $1");
        sqlx::query_as::<_, BuildJobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List jobs matching `filter`, newest first.
    pub async fn list(
        pool: &PgPool,
        filter: &BuildJobFilter,
    ) -> Result<Vec<BuildJobRow>, sqlx::Error> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM build_jobs"));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC");
        qb.build_query_as::<BuildJobRow>().fetch_all(pool).await
    }

    /// Delete jobs matching `filter`. Returns the number of rows removed.
    pub async fn delete(pool: &PgPool, filter: &BuildJobFilter) -> Result<u64, sqlx::Error> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM build_jobs");
        push_filter(&mut qb, filter);
        let result = qb.build().execute(pool).await?;
        Ok(result.rows_affected())
    }
}

/// Append a `WHERE` clause for the fields present in `filter`.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &BuildJobFilter) {
    let mut sep = " WHERE ";
    if let Some(brand_id) = &filter.brand_id {
        qb.push(sep).push("brand_id = ").push_bind(brand_id.clone());
        sep = " AND ";
    }
    if let Some(status) = filter.status {
        qb.push(sep).push("status_id = ").push_bind(status.id());
    }
}
