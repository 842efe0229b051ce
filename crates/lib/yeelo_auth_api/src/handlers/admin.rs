//! Administrative user management. Super-admin only.

use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use uuid::Uuid;

use crate::AppState;
use crate::error::AppResult;
use crate::middleware::auth::AuthenticatedUser;
use crate::models::SessionsResponse;
use crate::services::auth;

/// `POST /admin/users/{id}/deactivate`
pub async fn deactivate_user_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    auth::deactivate_user(&state, &caller, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /admin/users/{id}/sessions`
pub async fn list_sessions_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<SessionsResponse>> {
    let sessions = auth::list_sessions(&state, &caller, user_id).await?;
    Ok(Json(SessionsResponse { sessions }))
}
