use crate::state::AppState;
use axum::Router;

pub mod dto;
pub mod extractors;
pub mod handlers;
pub mod jwt;
pub mod oauth;
pub mod password;
pub mod repo;
pub mod repo_types;
pub mod services;
pub mod session;

pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .merge(handlers::credential_routes(state))
        .merge(handlers::session_routes())
        .merge(handlers::google_routes())
}
