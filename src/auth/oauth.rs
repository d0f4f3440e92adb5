//! Google sign-in via the OAuth 2.0 authorization-code flow.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{cache::KvCache, config::GoogleConfig, error::AppError};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";
const STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Verified profile handed back by an identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    /// Stable provider-side user id.
    pub provider_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Consent page the browser is sent to.
    fn authorize_url(&self, state: &str) -> String;
    async fn exchange_code(&self, code: &str) -> Result<ProviderProfile, AppError>;
}

pub struct GoogleProvider {
    http: reqwest::Client,
    cfg: GoogleConfig,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    given_name: Option<String>,
    family_name: Option<String>,
    name: Option<String>,
    picture: Option<String>,
}

impl From<GoogleUserInfo> for ProviderProfile {
    fn from(info: GoogleUserInfo) -> Self {
        Self {
            provider_id: info.sub,
            // unverified addresses must not link onto existing accounts
            email: info.email.filter(|_| info.email_verified),
            first_name: info.given_name,
            last_name: info.family_name,
            display_name: info.name,
            avatar_url: info.picture,
        }
    }
}

impl GoogleProvider {
    pub fn new(http: reqwest::Client, cfg: GoogleConfig) -> Self {
        Self { http, cfg }
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn authorize_url(&self, state: &str) -> String {
        format!(
            "{GOOGLE_AUTH_URL}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            urlencoding::encode(&self.cfg.client_id),
            urlencoding::encode(&self.cfg.callback_url),
            urlencoding::encode("openid email profile"),
            urlencoding::encode(state),
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderProfile, AppError> {
        let res = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", self.cfg.client_id.as_str()),
                ("client_secret", self.cfg.client_secret.as_str()),
                ("redirect_uri", self.cfg.callback_url.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .context("google token request")?;

        if !res.status().is_success() {
            warn!(status = %res.status(), "google rejected authorization code");
            return Err(AppError::auth("Google authentication failed"));
        }
        let token: TokenResponse = res.json().await.context("decode google token response")?;

        let info: GoogleUserInfo = self
            .http
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .context("google userinfo request")?
            .error_for_status()
            .context("google userinfo status")?
            .json()
            .await
            .context("decode google userinfo")?;

        debug!(provider_id = %info.sub, "google profile fetched");
        Ok(info.into())
    }
}

/// Single-use CSRF `state` values for the consent round trip.
#[derive(Clone)]
pub struct OAuthStateStore {
    cache: Arc<dyn KvCache>,
}

fn state_key(state: &str) -> String {
    format!("oauth_state:{state}")
}

impl OAuthStateStore {
    pub fn new(cache: Arc<dyn KvCache>) -> Self {
        Self { cache }
    }

    pub async fn issue(&self) -> anyhow::Result<String> {
        let state: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        self.cache.set_ex(&state_key(&state), "1", STATE_TTL).await?;
        Ok(state)
    }

    /// True only for the first use of a state this server issued.
    pub async fn consume(&self, state: &str) -> anyhow::Result<bool> {
        self.cache.delete(&state_key(state)).await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;

    use super::*;

    /// Provider that maps authorization codes to canned profiles.
    #[derive(Default)]
    pub struct FakeProvider {
        pub profiles: HashMap<String, ProviderProfile>,
    }

    #[async_trait]
    impl IdentityProvider for FakeProvider {
        fn authorize_url(&self, state: &str) -> String {
            format!("https://consent.test/auth?state={state}")
        }

        async fn exchange_code(&self, code: &str) -> Result<ProviderProfile, AppError> {
            self.profiles
                .get(code)
                .cloned()
                .ok_or_else(|| AppError::auth("Google authentication failed"))
        }
    }
}
