//! Requester identity extractor.
//!
//! Authentication happens at the gateway in front of this service; it
//! forwards the caller as `x-user-id` and, for API-token calls,
//! `x-token-id`. Requests carrying neither act as the system.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use fleet_core::admission::Requester;
use fleet_core::types::DbId;

use crate::error::AppError;
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const TOKEN_ID_HEADER: &str = "x-token-id";

/// The caller as forwarded by the gateway.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub Requester);

impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Caller(Requester {
            user_id: id_header(parts, USER_ID_HEADER)?,
            token_id: id_header(parts, TOKEN_ID_HEADER)?,
        }))
    }
}

fn id_header(parts: &Parts, name: &str) -> Result<Option<DbId>, AppError> {
    let Some(value) = parts.headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<DbId>().ok())
        .filter(|id| *id > 0)
        .map(Some)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid {name} header")))
}
