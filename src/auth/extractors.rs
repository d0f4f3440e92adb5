use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use tracing::warn;
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

/// Identity behind a verified bearer token with a live session entry.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub session_id: Uuid,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| AppError::auth("Access token required"))?;

        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::auth("Invalid authorization header"))?;

        let claims = state.jwt.verify(token).map_err(|e| {
            warn!(error = %e, "invalid or expired token");
            AppError::auth("Invalid or expired token")
        })?;

        // signature alone is not enough: the session entry must still exist
        match state.sessions.owner(claims.sid).await? {
            Some(owner) if owner == claims.sub => Ok(AuthUser {
                user_id: claims.sub,
                email: claims.email,
                session_id: claims.sid,
            }),
            _ => {
                warn!(user_id = %claims.sub, session_id = %claims.sid, "session not found");
                Err(AppError::auth("Session expired or invalid"))
            }
        }
    }
}
