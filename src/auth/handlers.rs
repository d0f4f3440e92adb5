use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    middleware,
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use tracing::{instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthResponse, GoogleCallbackQuery, LoginRequest, LogoutResponse, PublicUser,
            RegisterRequest, UpdateProfileRequest, UserResponse,
        },
        extractors::AuthUser,
        services::{self, Issued},
    },
    error::AppError,
    rate_limit::limit_auth_attempts,
    state::AppState,
};

/// Register and login share one per-address attempt budget.
pub fn credential_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            limit_auth_attempts,
        ))
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(get_me).patch(update_me))
}

pub fn google_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/google", get(google_start))
        .route("/auth/google/callback", get(google_callback))
}

fn auth_response(issued: Issued) -> AuthResponse {
    AuthResponse {
        access_token: issued.access_token,
        user: PublicUser::from(issued.user),
    }
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), AppError> {
    let Json(payload) = payload?;
    let issued = services::register(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(auth_response(issued))))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, AppError> {
    let Json(payload) = payload?;
    let issued = services::login(&state, &payload.email, &payload.password).await?;
    Ok(Json(auth_response(issued)))
}

#[instrument(skip(state, user), fields(user_id = %user.user_id))]
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<LogoutResponse>, AppError> {
    services::logout(&state, user.user_id, user.session_id).await?;
    Ok(Json(LogoutResponse {
        success: true,
        message: "Logged out successfully",
    }))
}

#[instrument(skip(state, user), fields(user_id = %user.user_id))]
pub async fn get_me(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UserResponse>, AppError> {
    let user = services::current_user(&state, user.user_id).await?;
    Ok(Json(UserResponse { user: user.into() }))
}

#[instrument(skip(state, user, payload), fields(user_id = %user.user_id))]
pub async fn update_me(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> Result<Json<UserResponse>, AppError> {
    let Json(payload) = payload?;
    let user = services::update_profile(&state, user.user_id, payload).await?;
    Ok(Json(UserResponse { user: user.into() }))
}

#[instrument(skip(state))]
pub async fn google_start(State(state): State<AppState>) -> Result<Redirect, AppError> {
    let provider = state
        .google
        .as_ref()
        .ok_or_else(|| AppError::NotFound("Google login is not configured".into()))?;
    let csrf_state = state.oauth_states.issue().await?;
    Ok(Redirect::temporary(&provider.authorize_url(&csrf_state)))
}

/// Always answers with a redirect to the frontend; failures travel in `?error=`.
#[instrument(skip(state, query))]
pub async fn google_callback(
    State(state): State<AppState>,
    Query(query): Query<GoogleCallbackQuery>,
) -> Redirect {
    let base = format!("{}/auth/callback", state.config.frontend_url.trim_end_matches('/'));
    match complete_google_login(&state, query).await {
        Ok(issued) => {
            let user = serde_json::to_string(&PublicUser::from(issued.user)).unwrap_or_default();
            Redirect::temporary(&format!(
                "{base}?token={}&user={}",
                urlencoding::encode(&issued.access_token),
                urlencoding::encode(&user)
            ))
        }
        Err(e) => {
            let message = match e {
                AppError::Internal(_) => "Google authentication failed".to_string(),
                other => other.to_string(),
            };
            warn!(error = %message, "google callback failed");
            Redirect::temporary(&format!("{base}?error={}", urlencoding::encode(&message)))
        }
    }
}

async fn complete_google_login(
    state: &AppState,
    query: GoogleCallbackQuery,
) -> Result<Issued, AppError> {
    let provider = state
        .google
        .as_ref()
        .ok_or_else(|| AppError::NotFound("Google login is not configured".into()))?;
    let csrf_state = query
        .state
        .ok_or_else(|| AppError::auth("Missing OAuth state"))?;
    // spent even when consent was cancelled
    if !state.oauth_states.consume(&csrf_state).await? {
        return Err(AppError::auth("Invalid or expired OAuth state"));
    }
    if let Some(err) = query.error {
        warn!(provider_error = %err, "consent denied or failed");
        return Err(AppError::auth("Google authentication was cancelled"));
    }
    let code = query
        .code
        .ok_or_else(|| AppError::auth("Missing authorization code"))?;

    let profile = provider.exchange_code(&code).await?;
    services::login_with_provider(state, profile).await
}
