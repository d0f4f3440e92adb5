use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{error::AppError, state::AppState};

/// Address the limiter keys on. Forwarded headers are only honored when the
/// service is configured to sit behind a trusted proxy.
pub fn client_addr(req: &Request, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(addr) = forwarded {
            return addr.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Fixed-window limit on register/login attempts per client address.
pub async fn limit_auth_attempts(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let cfg = &state.config.rate_limit;
    let addr = client_addr(&req, cfg.trust_proxy);
    let key = format!("ratelimit:auth:{addr}");

    let (count, secs_left) = state
        .cache
        .hit(&key, Duration::from_secs(cfg.window_secs))
        .await?;
    if count > cfg.max_attempts {
        warn!(%addr, count, "auth rate limit exceeded");
        return Err(AppError::RateLimited {
            retry_after_secs: secs_left.max(1),
        });
    }

    let mut res = next.run(req).await;
    let remaining = cfg.max_attempts.saturating_sub(count);
    res.headers_mut()
        .insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    Ok(res)
}
