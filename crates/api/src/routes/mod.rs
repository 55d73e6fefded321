pub mod builds;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /builds                                 list, submit
/// /builds/environment                     prerequisite report
/// /builds/cache/clear                     remove stale workspaces and logs (POST)
/// /builds/failed                          purge failed records (DELETE)
/// /builds/{id}                            status snapshot
/// /builds/{id}/cancel                     request cancellation (POST)
/// /builds/{id}/download                   stream or redirect to the artifact
/// /builds/{id}/distribution               send a remote build to a track (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/builds", builds::router())
}
