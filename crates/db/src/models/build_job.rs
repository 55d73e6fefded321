//! Row model for the `build_jobs` table.

use brandkit_core::build_job::{BuildJob, BuildMode, BuildStatus, FailureKind, StatusId};
use brandkit_core::types::{JobId, Timestamp};
use sqlx::FromRow;

use crate::store::StoreError;

/// A row from `build_jobs`, with lookup ids still in their SMALLINT form.
#[derive(Debug, Clone, FromRow)]
pub struct BuildJobRow {
    pub id: JobId,
    pub brand_id: String,
    pub status_id: StatusId,
    pub progress_percent: i16,
    pub message: String,
    pub build_mode_id: StatusId,
    pub external_build_id: Option<String>,
    pub artifact_locator: Option<String>,
    pub artifact_path: Option<String>,
    pub log_path: Option<String>,
    pub error_text: Option<String>,
    pub failure_kind: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl TryFrom<BuildJobRow> for BuildJob {
    type Error = StoreError;

    fn try_from(row: BuildJobRow) -> Result<Self, Self::Error> {
        let status = BuildStatus::from_id(row.status_id)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status_id {}", row.status_id)))?;
        let build_mode = BuildMode::from_id(row.build_mode_id).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown build_mode_id {}", row.build_mode_id))
        })?;
        let failure_kind = match row.failure_kind.as_deref() {
            None => None,
            Some(raw) => Some(
                FailureKind::parse(raw)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown failure_kind '{raw}'")))?,
            ),
        };

        Ok(BuildJob {
            id: row.id,
            brand_id: row.brand_id,
            status,
            progress_percent: row.progress_percent.clamp(0, 100) as u8,
            message: row.message,
            build_mode,
            external_build_id: row.external_build_id,
            artifact_locator: row.artifact_locator,
            artifact_path: row.artifact_path,
            log_path: row.log_path,
            error_text: row.error_text,
            failure_kind,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}
