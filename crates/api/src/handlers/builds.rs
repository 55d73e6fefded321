//! Handlers for the `/builds` resource.
//!
//! Thin bindings over [`BuildJobManager`](brandkit_pipeline::BuildJobManager):
//! every rule about admission, cancellation, and artifact resolution lives
//! in the pipeline crate.

use std::path::Path as FsPath;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use brandkit_core::brand::BrandCustomization;
use brandkit_core::types::JobId;
use brandkit_pipeline::publish::content_type;
use brandkit_pipeline::{BuildError, DownloadHandle};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitBuildRequest {
    pub brand_id: String,
    #[serde(flatten)]
    pub brand: BrandCustomization,
}

#[derive(Debug, Serialize)]
pub struct SubmitBuildResponse {
    pub job_id: JobId,
}

/// `?brand_id=` filter shared by listing and purging.
#[derive(Debug, Deserialize)]
pub struct BrandFilterParams {
    pub brand_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DistributionRequest {
    pub track: String,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub deleted: u64,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/builds
///
/// Admit a build into the single slot. Returns 202 with the job id; the
/// build runs in the background. 409 while another build is active, 422
/// when the build environment is incomplete.
pub async fn submit_build(
    State(state): State<AppState>,
    Json(input): Json<SubmitBuildRequest>,
) -> AppResult<impl IntoResponse> {
    let job_id = state.manager.submit(&input.brand_id, input.brand).await?;

    tracing::info!(job_id = %job_id, brand_id = %input.brand_id, "Build accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: SubmitBuildResponse { job_id },
        }),
    ))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/builds
///
/// List builds newest first, optionally for one brand.
pub async fn list_builds(
    State(state): State<AppState>,
    Query(params): Query<BrandFilterParams>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.manager.list(params.brand_id.as_deref()).await?;
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/builds/{id}
pub async fn get_build(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.manager.status(job_id).await?;
    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/builds/{id}/cancel
///
/// Request cancellation. Returns 202 immediately; the job reaches
/// `cancelled` once its worker observes the request.
pub async fn cancel_build(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let outcome = state.manager.cancel(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: outcome })))
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// GET /api/v1/builds/{id}/download
///
/// Streams the stored package when it is on local disk, otherwise
/// redirects to its published URL.
pub async fn download_build(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Response> {
    match state.manager.download(job_id).await? {
        DownloadHandle::Local(path) => stream_file(job_id, &path).await,
        DownloadHandle::Remote(url) => Ok(Redirect::temporary(&url).into_response()),
    }
}

/// The file may disappear between resolution and open; that is the same
/// missing artifact the manager reports.
async fn stream_file(job_id: JobId, path: &FsPath) -> AppResult<Response> {
    let file = tokio::fs::File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AppError::from(BuildError::ArtifactMissing(job_id)),
        _ => AppError::InternalError(format!("open {}: {e}", path.display())),
    })?;
    let size = file
        .metadata()
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?
        .len();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', ""))
        .unwrap_or_else(|| "artifact".to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type(path))
        .header(header::CONTENT_LENGTH, size.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::InternalError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Distribution
// ---------------------------------------------------------------------------

/// POST /api/v1/builds/{id}/distribution
///
/// Send a submitted remote build to a store track.
pub async fn submit_distribution(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    Json(input): Json<DistributionRequest>,
) -> AppResult<impl IntoResponse> {
    let receipt = state
        .manager
        .submit_to_distribution(job_id, &input.track)
        .await?;
    Ok(Json(DataResponse { data: receipt }))
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

/// POST /api/v1/builds/cache/clear
///
/// Remove every workspace and stage log not belonging to the active build.
pub async fn clear_cache(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let report = state.manager.clear_cache().await;
    Ok(Json(DataResponse { data: report }))
}

/// DELETE /api/v1/builds/failed
///
/// Delete failed build records, optionally for one brand.
pub async fn purge_failed(
    State(state): State<AppState>,
    Query(params): Query<BrandFilterParams>,
) -> AppResult<impl IntoResponse> {
    let deleted = state.manager.purge_failed(params.brand_id.as_deref()).await?;
    Ok(Json(DataResponse {
        data: PurgeResponse { deleted },
    }))
}

/// GET /api/v1/builds/environment
///
/// Report which build prerequisites are present on this host.
pub async fn environment(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let report = state.manager.environment().await;
    Ok(Json(DataResponse { data: report }))
}
