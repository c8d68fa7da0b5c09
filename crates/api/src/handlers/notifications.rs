use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::error::{AppError, AppResult};
use crate::middleware::requester::Caller;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/notifications
///
/// The caller's task notifications, newest first. Requires `x-user-id`.
pub async fn list_notifications(
    Caller(requester): Caller,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let user_id = requester
        .user_id
        .ok_or_else(|| AppError::BadRequest("x-user-id header is required".into()))?;
    let notifications = state
        .scheduler
        .store()
        .list_user_notifications(user_id)
        .await?;
    Ok(Json(DataResponse {
        data: notifications,
    }))
}
