use std::{sync::Arc, time::Duration};

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::{
    auth::{
        jwt::JwtKeys,
        oauth::{GoogleProvider, IdentityProvider, OAuthStateStore},
        repo::{PgUserRepo, UserRepo},
        session::SessionStore,
    },
    cache::{KvCache, MemoryCache, RedisCache},
    config::{AppConfig, CacheKind},
};

const MEMORY_SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserRepo>,
    pub cache: Arc<dyn KvCache>,
    pub sessions: SessionStore,
    pub oauth_states: OAuthStateStore,
    pub google: Option<Arc<dyn IdentityProvider>>,
    pub jwt: JwtKeys,
}

impl AppState {
    /// Connects both stores and applies migrations; any failure aborts startup.
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;
        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .context("run migrations")?;
        info!("database ready");

        let cache: Arc<dyn KvCache> = match config.cache {
            CacheKind::Redis => Arc::new(RedisCache::connect(&config.redis.url()).await?),
            CacheKind::Memory => {
                info!("using in-process cache; sessions will not survive restarts");
                let cache = Arc::new(MemoryCache::new());
                MemoryCache::spawn_sweeper(&cache, MEMORY_SWEEP_PERIOD);
                cache as Arc<dyn KvCache>
            }
        };

        let google = config.google.clone().map(|cfg| {
            Arc::new(GoogleProvider::new(reqwest::Client::new(), cfg)) as Arc<dyn IdentityProvider>
        });
        if google.is_none() {
            info!("google login disabled: GOOGLE_* not configured");
        }

        Ok(Self::from_parts(
            Arc::new(config),
            Arc::new(PgUserRepo::new(db)),
            cache,
            google,
        ))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserRepo>,
        cache: Arc<dyn KvCache>,
        google: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        let sessions = SessionStore::new(
            cache.clone(),
            Duration::from_secs(config.session_ttl_secs),
        );
        Self {
            jwt: JwtKeys::new(&config.jwt),
            oauth_states: OAuthStateStore::new(cache.clone()),
            sessions,
            config,
            users,
            cache,
            google,
        }
    }
}
