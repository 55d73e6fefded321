//! Route definitions for the `/builds` resource.

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers::builds;
use crate::state::AppState;

/// Routes mounted at `/builds`.
///
/// ```text
/// GET    /                     -> list_builds
/// POST   /                     -> submit_build
/// GET    /environment          -> environment
/// POST   /cache/clear          -> clear_cache
/// DELETE /failed               -> purge_failed
/// GET    /{id}                 -> get_build
/// POST   /{id}/cancel          -> cancel_build
/// GET    /{id}/download        -> download_build
/// POST   /{id}/distribution    -> submit_distribution
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(builds::list_builds).post(builds::submit_build))
        .route("/environment", get(builds::environment))
        .route("/cache/clear", post(builds::clear_cache))
        .route("/failed", delete(builds::purge_failed))
        .route("/{id}", get(builds::get_build))
        .route("/{id}/cancel", post(builds::cancel_build))
        .route("/{id}/download", get(builds::download_build))
        .route("/{id}/distribution", post(builds::submit_distribution))
}
