use axum_extra::extract::cookie::Key;
use url::Url;

use crate::error::Error;

/// Session TTL windows, in seconds.
///
/// `max_life_time_secs` is the absolute lifetime of a session (the record
/// key's TTL, set once at creation). `max_idle_time_secs` is the sliding idle
/// window (the sentinel key's TTL, reset on activity).
#[derive(Debug, Clone, Copy)]
pub struct SessionTtl {
    pub max_life_time_secs: u64,
    pub max_idle_time_secs: u64,
}

impl Default for SessionTtl {
    fn default() -> Self {
        Self {
            max_life_time_secs: 86_400,
            max_idle_time_secs: 1_800,
        }
    }
}

/// Session cookie attributes, set by the transport layer.
///
/// The store persists sessions keyed by the cookie's value but never
/// interprets these attributes.
#[derive(Clone)]
pub struct CookieSettings {
    pub(crate) key: Key,
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) secure: bool,
}

impl CookieSettings {
    fn defaults() -> Self {
        Self {
            key: Key::generate(),
            name: "backstage-cookie".into(),
            path: "/".into(),
            secure: true,
        }
    }
}

/// Gateway configuration.
///
/// Required fields are constructor parameters — no runtime "missing field"
/// errors. Use [`from_env()`](GatewayConfig::from_env) for convention-based
/// setup, or [`new()`](GatewayConfig::new) with `with_*` methods for full
/// control.
pub struct GatewayConfig {
    pub(crate) base_url: Url,
    pub(crate) keycloak_url: Url,
    pub(crate) client_id: String,
    pub(crate) redis_url: String,
    pub(crate) redis_db: i64,
    pub(crate) ttl: SessionTtl,
    pub(crate) cookie: CookieSettings,
}

impl GatewayConfig {
    /// Create config with the required endpoints and OAuth2 client id.
    #[must_use]
    pub fn new(base_url: Url, keycloak_url: Url, client_id: impl Into<String>) -> Self {
        Self {
            base_url,
            keycloak_url,
            client_id: client_id.into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            redis_db: 0,
            ttl: SessionTtl::default(),
            cookie: CookieSettings::defaults(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `BASE_URL`: public base URL of the gateway (return redirects)
    /// - `KEYCLOAK_URL`: identity provider base URL
    /// - `KEYCLOAK_CLIENT_ID`: OAuth2 client id
    ///
    /// # Optional env vars
    /// - `REDIS_URL` (default `redis://127.0.0.1:6379`)
    /// - `REDIS_DB` (default `0`)
    /// - `SESSION_MAX_LIFE_TIME_SEC` (default `86400`)
    /// - `SESSION_MAX_IDLE_TIME_SEC` (default `1800`)
    /// - `SESSION_COOKIE_NAME` (default `backstage-cookie`)
    /// - `SESSION_COOKIE_HTTPS`: set to `"0"` or `"false"` to drop `Secure`
    /// - `COOKIE_KEY`: cookie encryption key bytes (at least 64); an
    ///   ephemeral key is generated when absent
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required env vars are missing or invalid.
    pub fn from_env() -> Result<Self, Error> {
        let base_url = required_url("BASE_URL")?;
        let keycloak_url = required_url("KEYCLOAK_URL")?;
        let client_id = std::env::var("KEYCLOAK_CLIENT_ID")
            .map_err(|_| Error::Config("KEYCLOAK_CLIENT_ID is required".into()))?;

        let mut config = Self::new(base_url, keycloak_url, client_id);

        if let Ok(url) = std::env::var("REDIS_URL") {
            config = config.with_redis_url(url);
        }
        if let Ok(db) = std::env::var("REDIS_DB") {
            let db = db
                .parse()
                .map_err(|e| Error::Config(format!("REDIS_DB: {e}")))?;
            config = config.with_redis_db(db);
        }
        if let Ok(secs) = std::env::var("SESSION_MAX_LIFE_TIME_SEC") {
            let secs = secs
                .parse()
                .map_err(|e| Error::Config(format!("SESSION_MAX_LIFE_TIME_SEC: {e}")))?;
            config.ttl.max_life_time_secs = secs;
        }
        if let Ok(secs) = std::env::var("SESSION_MAX_IDLE_TIME_SEC") {
            let secs = secs
                .parse()
                .map_err(|e| Error::Config(format!("SESSION_MAX_IDLE_TIME_SEC: {e}")))?;
            config.ttl.max_idle_time_secs = secs;
        }
        if let Ok(name) = std::env::var("SESSION_COOKIE_NAME") {
            config.cookie.name = name;
        }
        if matches!(
            std::env::var("SESSION_COOKIE_HTTPS").as_deref(),
            Ok("0") | Ok("false")
        ) {
            config.cookie.secure = false;
        }
        if let Ok(k) = std::env::var("COOKIE_KEY") {
            let key = Key::try_from(k.as_bytes()).map_err(|_| {
                Error::Config(
                    "COOKIE_KEY is set but invalid (must be at least 64 bytes). \
                     Remove the env var to use an ephemeral key, or provide a valid key."
                        .into(),
                )
            })?;
            config.cookie.key = key;
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    #[must_use]
    pub fn with_redis_db(mut self, db: i64) -> Self {
        self.redis_db = db;
        self
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: SessionTtl) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_cookie_key(mut self, key: Key) -> Self {
        self.cookie.key = key;
        self
    }

    #[must_use]
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie.name = name.into();
        self
    }

    #[must_use]
    pub fn with_cookie_path(mut self, path: impl Into<String>) -> Self {
        self.cookie.path = path.into();
        self
    }

    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.cookie.secure = secure;
        self
    }

    /// Public base URL of the gateway.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Identity provider base URL.
    #[must_use]
    pub fn keycloak_url(&self) -> &Url {
        &self.keycloak_url
    }

    /// OAuth2 client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Session TTL windows.
    #[must_use]
    pub fn session_ttl(&self) -> SessionTtl {
        self.ttl
    }

    /// Redis connection URL.
    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis_url
    }

    /// Redis logical database, selecting the keyspace-notification channel.
    #[must_use]
    pub fn redis_db(&self) -> i64 {
        self.redis_db
    }

    /// Session cookie settings, including the private-jar key.
    #[must_use]
    pub fn cookie_settings(&self) -> &CookieSettings {
        &self.cookie
    }
}

fn required_url(var: &'static str) -> Result<Url, Error> {
    let raw = std::env::var(var).map_err(|_| Error::Config(format!("{var} is required")))?;
    raw.parse().map_err(|e| Error::Config(format!("{var}: {e}")))
}
