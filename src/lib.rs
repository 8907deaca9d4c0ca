#![doc = include_str!("../README.md")]

pub mod config;
mod cookies;
pub mod error;
pub mod flow;
pub mod health;
pub mod keycloak;
pub mod pkce;
pub mod routes;
pub mod session;

use std::sync::Arc;

use axum::Router;

// Re-exports for convenient access
pub use config::{CookieSettings, GatewayConfig, SessionTtl};
pub use error::Error;
pub use flow::{AuthFlow, TokenRevoker, UserInfoPayload};
pub use health::{NullServiceState, ServiceState};
pub use keycloak::{KeycloakClient, Permission, TokenSet, UserProfile};
pub use routes::auth_routes;
pub use session::{
    DestroyHook, ExpiryListener, KvBackend, RedisBackend, Session, SessionStore,
};

/// A fully wired gateway: the router to mount and the expiry listener to
/// shut down with the process.
pub struct AuthGateway {
    pub router: Router,
    pub listener: ExpiryListener,
}

/// Wire the whole stack from a [`GatewayConfig`]: Redis command and
/// notification connections, the session store with token revocation as its
/// pre-destroy hook, the auth flow, and the router.
///
/// `mount_path` is the public prefix the router will be served under; it
/// determines the OAuth2 redirect URI registered with the provider
/// (`{base_url}{mount_path}/auth/return`).
///
/// # Errors
///
/// Fails if either Redis connection cannot be established or the configured
/// URLs do not compose.
pub async fn bootstrap(
    config: GatewayConfig,
    mount_path: &str,
    state: Arc<dyn ServiceState>,
) -> Result<AuthGateway, Error> {
    let redirect_uri = config
        .base_url()
        .join(&format!("{}/auth/return", mount_path.trim_end_matches('/')))
        .map_err(|e| Error::Config(format!("mount path {mount_path:?}: {e}")))?;
    let keycloak = Arc::new(KeycloakClient::new(
        config.keycloak_url().clone(),
        config.client_id(),
        redirect_uri,
    ));

    let backend = RedisBackend::connect(&config.redis_url, Arc::clone(&state)).await?;
    let store = Arc::new(
        SessionStore::new(backend, config.session_ttl())
            .with_destroy_hook(TokenRevoker::new(Arc::clone(&keycloak))),
    );
    let listener = ExpiryListener::spawn(
        &config.redis_url,
        config.redis_db,
        Arc::clone(&store),
        state,
    )
    .await?;

    let flow = Arc::new(AuthFlow::new(store, keycloak, config.base_url().clone()));
    let router = auth_routes(flow, config.cookie.clone());

    Ok(AuthGateway { router, listener })
}
