use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(self) -> bool {
        self == Environment::Development
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!(
                "redis://:{}@{}:{}",
                urlencoding::encode(pw),
                self.host,
                self.port
            ),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub max_attempts: u64,
    pub window_secs: u64,
    /// Take the client address from the first `X-Forwarded-For` hop.
    pub trust_proxy: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 15 * 60,
            trust_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    pub database_url: String,
    pub cache: CacheKind,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub session_ttl_secs: u64,
    pub google: Option<GoogleConfig>,
    pub frontend_url: String,
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = match var_or("APP_ENV", "production").as_str() {
            "development" | "dev" => Environment::Development,
            _ => Environment::Production,
        };

        let cache = match var_or("CACHE_BACKEND", "redis").as_str() {
            "memory" => CacheKind::Memory,
            "redis" => CacheKind::Redis,
            other => anyhow::bail!("unknown CACHE_BACKEND {other:?}"),
        };

        let redis = RedisConfig {
            host: var_or("REDIS_HOST", "127.0.0.1"),
            port: parse_or("REDIS_PORT", 6379),
            password: std::env::var("REDIS_PASSWORD").ok().filter(|v| !v.is_empty()),
        };

        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            issuer: var_or("JWT_ISSUER", "gatekeep"),
            audience: var_or("JWT_AUDIENCE", "gatekeep-users"),
            ttl_minutes: parse_or("JWT_TTL_MINUTES", 60 * 24),
        };

        let google = match (
            std::env::var("GOOGLE_CLIENT_ID"),
            std::env::var("GOOGLE_CLIENT_SECRET"),
            std::env::var("GOOGLE_CALLBACK_URL"),
        ) {
            (Ok(client_id), Ok(client_secret), Ok(callback_url)) => Some(GoogleConfig {
                client_id,
                client_secret,
                callback_url,
            }),
            _ => None,
        };

        let rate_limit = RateLimitConfig {
            max_attempts: parse_or("RATE_LIMIT_MAX_ATTEMPTS", 5),
            window_secs: parse_or("RATE_LIMIT_WINDOW_SECS", 15 * 60),
            trust_proxy: parse_or("TRUST_PROXY", false),
        };

        Ok(Self {
            host: var_or("APP_HOST", "0.0.0.0"),
            port: parse_or("APP_PORT", 8080),
            environment,
            database_url: database_url_from_env()?,
            cache,
            redis,
            jwt,
            session_ttl_secs: parse_or("SESSION_TTL_SECS", 24 * 60 * 60),
            google,
            frontend_url: var_or("FRONTEND_URL", "http://localhost:3000"),
            rate_limit,
        })
    }
}

fn database_url_from_env() -> anyhow::Result<String> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return Ok(url);
    }
    let name = std::env::var("DB_NAME").context("DATABASE_URL or DB_NAME must be set")?;
    let user = std::env::var("DB_USER").context("DB_USER must be set")?;
    let password = std::env::var("DB_PASSWORD").unwrap_or_default();
    Ok(format!(
        "postgres://{}:{}@{}:{}/{}",
        urlencoding::encode(&user),
        urlencoding::encode(&password),
        var_or("DB_HOST", "localhost"),
        parse_or::<u16>("DB_PORT", 5432),
        name
    ))
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
