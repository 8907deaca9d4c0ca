//! Authentication route surface.
//!
//! Thin over [`AuthFlow`]: parse the query string, resolve the sid cookie,
//! delegate, translate the result. Mount the router under the gateway's
//! public prefix (typically `/backstage/v1`).

use std::sync::Arc;

use axum::Router;
use axum::extract::{FromRef, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Json;
use axum_extra::extract::PrivateCookieJar;
use axum_extra::extract::cookie::Key;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::config::CookieSettings;
use crate::cookies;
use crate::error::Error;
use crate::flow::AuthFlow;
use crate::session::backend::KvBackend;

/// Shared route state: the flow plus the cookie settings (including the
/// private-jar key).
pub struct GatewayState<B> {
    flow: Arc<AuthFlow<B>>,
    cookie: CookieSettings,
}

impl<B> Clone for GatewayState<B> {
    fn clone(&self) -> Self {
        Self {
            flow: Arc::clone(&self.flow),
            cookie: self.cookie.clone(),
        }
    }
}

impl<B> FromRef<GatewayState<B>> for Key {
    fn from_ref(state: &GatewayState<B>) -> Key {
        state.cookie.key.clone()
    }
}

/// Create the authentication router.
pub fn auth_routes<B: KvBackend>(flow: Arc<AuthFlow<B>>, cookie: CookieSettings) -> Router {
    let state = GatewayState { flow, cookie };

    Router::new()
        .route("/auth", get(login::<B>))
        .route("/auth/return", get(callback::<B>))
        .route("/auth/user-info", get(user_info::<B>))
        .route("/auth/revoke", get(revoke::<B>))
        .with_state(state)
}

// ── Login ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LoginParams {
    tenant: Option<String>,
    #[serde(rename = "return")]
    return_path: Option<String>,
}

async fn login<B: KvBackend>(
    State(state): State<GatewayState<B>>,
    jar: PrivateCookieJar,
    Query(params): Query<LoginParams>,
) -> Result<(PrivateCookieJar, Redirect), Response> {
    let Some(tenant) = params.tenant else {
        return Err(missing_params(&["tenant"]));
    };
    let return_path = params.return_path.as_deref().unwrap_or("/");

    // Reuse the caller's sid so a re-login replaces their session in place.
    let sid = cookies::get_sid(&jar, &state.cookie).unwrap_or_else(new_sid);

    let url = state
        .flow
        .build_login_redirect(&sid, &tenant, return_path)
        .await
        .map_err(IntoResponse::into_response)?;

    let jar = jar.add(cookies::session_cookie(&state.cookie, &sid));
    Ok((jar, Redirect::to(url.as_str())))
}

// ── Callback ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
}

async fn callback<B: KvBackend>(
    State(state): State<GatewayState<B>>,
    jar: PrivateCookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect, Response> {
    let mut missing = Vec::new();
    if params.code.is_none() {
        missing.push("code");
    }
    if params.state.is_none() {
        missing.push("state");
    }
    if !missing.is_empty() {
        return Err(missing_params(&missing));
    }
    let (code, oauth_state) = (params.code.unwrap_or_default(), params.state.unwrap_or_default());

    let sid = cookies::get_sid(&jar, &state.cookie)
        .ok_or_else(|| Error::NoValidSession.into_response())?;

    let url = state
        .flow
        .complete_login(&sid, &code, &oauth_state)
        .await
        .map_err(IntoResponse::into_response)?;

    Ok(Redirect::to(url.as_str()))
}

// ── User info ──────────────────────────────────────────────────────

async fn user_info<B: KvBackend>(
    State(state): State<GatewayState<B>>,
    jar: PrivateCookieJar,
) -> Result<Response, Response> {
    let sid = cookies::get_sid(&jar, &state.cookie)
        .ok_or_else(|| Error::NoValidSession.into_response())?;

    let payload = state
        .flow
        .user_info(&sid)
        .await
        .map_err(IntoResponse::into_response)?;

    Ok(Json(payload).into_response())
}

// ── Revoke ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RevokeParams {
    #[serde(rename = "return")]
    return_path: Option<String>,
}

async fn revoke<B: KvBackend>(
    State(state): State<GatewayState<B>>,
    jar: PrivateCookieJar,
    Query(params): Query<RevokeParams>,
) -> Result<(PrivateCookieJar, Redirect), Response> {
    let return_path = params.return_path.as_deref().unwrap_or("/");

    // No cookie still yields the "no active session" redirect, via a sid
    // that cannot match anything.
    let sid = cookies::get_sid(&jar, &state.cookie).unwrap_or_else(new_sid);

    let url = state
        .flow
        .revoke(&sid, return_path)
        .await
        .map_err(IntoResponse::into_response)?;

    let jar = jar.remove(cookies::clear_session_cookie(&state.cookie));
    Ok((jar, Redirect::to(url.as_str())))
}

// ── Helpers ────────────────────────────────────────────────────────

fn new_sid() -> String {
    let random_bytes: [u8; 24] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

fn missing_params(names: &[&str]) -> Response {
    let detail = names
        .iter()
        .map(|name| format!("request.query should have required property '{name}'"))
        .collect::<Vec<_>>()
        .join(", ");
    (StatusCode::BAD_REQUEST, Json(json!({ "error": detail }))).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Error::NoValidSession => (StatusCode::UNAUTHORIZED, "There is no valid session."),
            Error::RefreshFailed => (
                StatusCode::UNAUTHORIZED,
                "It was not possible to renew the token.",
            ),
            e => {
                error!(error = %e, "unexpected error serving an auth route");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An unexpected error has occurred.",
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{GatewayConfig, SessionTtl};
    use crate::keycloak::KeycloakClient;
    use crate::session::backend::testing::MemoryBackend;
    use crate::session::store::SessionStore;

    // Nothing listens here; provider calls fail fast.
    const DEAD_IDP: &str = "http://127.0.0.1:1";

    fn test_router(idp_url: &str) -> Router {
        let config = GatewayConfig::new(
            "http://localhost:8000".parse().unwrap(),
            idp_url.parse().unwrap(),
            "gui",
        )
        .with_secure_cookies(false);

        let store = Arc::new(SessionStore::new(
            MemoryBackend::new(),
            SessionTtl::default(),
        ));
        let keycloak = Arc::new(KeycloakClient::new(
            config.keycloak_url().clone(),
            config.client_id(),
            "http://localhost:8000/auth/return".parse().unwrap(),
        ));
        let flow = Arc::new(AuthFlow::new(store, keycloak, config.base_url().clone()));
        auth_routes(flow, config.cookie.clone())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn login_redirects_to_provider_and_sets_cookie() {
        let response = test_router(DEAD_IDP)
            .oneshot(
                Request::get("/auth?tenant=admin&return=/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.contains("/auth/realms/admin/protocol/openid-connect/auth?"));
        let set_cookie = response.headers()["set-cookie"].to_str().unwrap();
        assert!(set_cookie.starts_with("backstage-cookie="));
        assert!(set_cookie.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn login_without_tenant_is_bad_request() {
        let response = test_router(DEAD_IDP)
            .oneshot(Request::get("/auth").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "request.query should have required property 'tenant'" })
        );
    }

    #[tokio::test]
    async fn callback_without_query_lists_missing_properties() {
        let response = test_router(DEAD_IDP)
            .oneshot(Request::get("/auth/return").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({
                "error": "request.query should have required property 'code', \
                          request.query should have required property 'state'"
            })
        );
    }

    #[tokio::test]
    async fn callback_without_cookie_is_unauthorized() {
        let response = test_router(DEAD_IDP)
            .oneshot(
                Request::get("/auth/return?code=code&state=state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "There is no valid session." })
        );
    }

    #[tokio::test]
    async fn user_info_without_cookie_is_unauthorized() {
        let response = test_router(DEAD_IDP)
            .oneshot(Request::get("/auth/user-info").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "There is no valid session." })
        );
    }

    #[tokio::test]
    async fn login_then_callback_round_trip() {
        // Stub token endpoint on an ephemeral port; the callback only needs
        // the code exchange.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stub = Router::new().route(
            "/auth/realms/{realm}/protocol/openid-connect/token",
            axum::routing::post(|| async {
                Json(json!({
                    "access_token": "new-access",
                    "expires_in": 300,
                    "refresh_token": "new-refresh",
                    "refresh_expires_in": 1800,
                    "token_type": "Bearer"
                }))
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, stub).await.unwrap();
        });

        let router = test_router(&format!("http://{addr}"));

        let login = router
            .clone()
            .oneshot(
                Request::get("/auth?tenant=admin&return=/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(login.status(), StatusCode::SEE_OTHER);
        let cookie = login.headers()["set-cookie"]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        let callback = router
            .oneshot(
                Request::get("/auth/return?code=code&state=the-state")
                    .header("cookie", cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(callback.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            callback.headers()["location"].to_str().unwrap(),
            "http://localhost:8000/?state=the-state"
        );
    }

    #[tokio::test]
    async fn revoke_without_session_redirects_with_error() {
        let response = test_router(DEAD_IDP)
            .oneshot(
                Request::get("/auth/revoke?return=/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()["location"].to_str().unwrap(),
            "http://localhost:8000/?error=There+is+no+active+session"
        );
    }
}
