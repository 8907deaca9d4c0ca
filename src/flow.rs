//! The OAuth2/PKCE login flow: login, callback, refresh-on-demand, revoke.
//!
//! `AuthFlow` is transport-agnostic — it takes a session id and returns
//! redirect URLs or payloads; cookie handling lives in the route layer.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::keycloak::{KeycloakClient, Permission, UserProfile};
use crate::pkce;
use crate::session::backend::KvBackend;
use crate::session::store::{DestroyHook, SessionStore};
use crate::session::types::Session;

/// Pre-destroy hook that revokes a dying session's tokens at the provider
/// via back-channel logout.
pub struct TokenRevoker {
    keycloak: Arc<KeycloakClient>,
}

impl TokenRevoker {
    #[must_use]
    pub fn new(keycloak: Arc<KeycloakClient>) -> Self {
        Self { keycloak }
    }
}

impl DestroyHook for TokenRevoker {
    async fn before_destroy(
        &self,
        realm: &str,
        _access_token: &str,
        refresh_token: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.keycloak
            .logout(realm, refresh_token)
            .await
            .map_err(Into::into)
    }
}

/// Response body of the user-info operation: the provider profile merged
/// with UMA permissions, the tenant, and the account-console URL.
#[derive(Debug, Serialize)]
pub struct UserInfoPayload {
    #[serde(flatten)]
    pub profile: UserProfile,
    pub permissions: Vec<Permission>,
    pub realm: String,
    /// Same value as `realm`; kept as a separate field for clients that
    /// speak in tenants.
    pub tenant: String,
    #[serde(rename = "urlAcc")]
    pub url_acc: String,
}

/// The login/callback/user-info/revoke state machine over a session store
/// and a Keycloak client.
pub struct AuthFlow<B> {
    store: Arc<SessionStore<B>>,
    keycloak: Arc<KeycloakClient>,
    base_url: Url,
}

impl<B: KvBackend> AuthFlow<B> {
    #[must_use]
    pub fn new(store: Arc<SessionStore<B>>, keycloak: Arc<KeycloakClient>, base_url: Url) -> Self {
        Self {
            store,
            keycloak,
            base_url,
        }
    }

    /// Start a login: write a PARTIAL session (realm, PKCE verifier, return
    /// path) under `sid` and return the provider's authorization URL.
    ///
    /// Overwrites any session already stored under `sid`, so a re-login
    /// discards stale state.
    pub async fn build_login_redirect(
        &self,
        sid: &str,
        tenant: &str,
        return_path: &str,
    ) -> Result<Url, Error> {
        let pair = pkce::generate_code_pair();
        let state = pkce::generate_state();

        let session = Session::partial(tenant, pair.verifier, return_path);
        self.store.set(sid, &session).await?;

        self.keycloak.build_login_url(tenant, &state, &pair.challenge)
    }

    /// Finish a login: exchange the authorization code using the PARTIAL
    /// session's verifier and return the redirect back into the app.
    ///
    /// A rejected exchange is not an error at this level — the user lands on
    /// `{return_path}?error=<message>` and can retry. Only a missing or
    /// token-less-and-verifier-less session is fatal.
    ///
    /// # Errors
    ///
    /// [`Error::NoValidSession`] if `sid` has no PARTIAL session.
    pub async fn complete_login(&self, sid: &str, code: &str, state: &str) -> Result<Url, Error> {
        let Some(mut session) = self.store.get(sid).await? else {
            return Err(Error::NoValidSession);
        };
        if !session.is_partial() {
            return Err(Error::NoValidSession);
        }
        // is_partial guarantees the fields below.
        let realm = session.realm.clone();
        let verifier = session.code_verifier.clone().unwrap_or_default();
        let return_path = session.return_path.clone().unwrap_or_default();

        match self
            .keycloak
            .token_by_authorization_code(&realm, code, &verifier)
            .await
        {
            Ok(tokens) => {
                session.apply_tokens(tokens);
                self.store.set(sid, &session).await?;
                debug!(realm, "login completed");
                self.return_url(&return_path, "state", state)
            }
            Err(e) => {
                warn!(realm, error = %e, "authorization-code exchange failed");
                self.return_url(&return_path, "error", &e.to_string())
            }
        }
    }

    /// Profile, permissions and account URL for the session's user,
    /// refreshing the access token first if it has expired.
    ///
    /// Counts as session activity: the idle window is restarted.
    ///
    /// # Errors
    ///
    /// [`Error::NoValidSession`] without a COMPLETE session,
    /// [`Error::RefreshFailed`] if an expired access token cannot be renewed
    /// (the session is destroyed as a side effect).
    pub async fn user_info(&self, sid: &str) -> Result<UserInfoPayload, Error> {
        let Some(mut session) = self.store.get(sid).await? else {
            return Err(Error::NoValidSession);
        };
        if !session.is_complete() {
            return Err(Error::NoValidSession);
        }
        self.store.restart_idle_ttl(sid).await?;

        // is_complete guarantees the token fields below.
        let realm = session.realm.clone();
        let access_token = if session.access_token_expired() {
            let refresh_token = session.refresh_token.clone().unwrap_or_default();
            let tokens = match self.keycloak.token_by_refresh(&realm, &refresh_token).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    // A failed refresh invalidates the whole session; stale
                    // tokens must not linger until the idle window lapses.
                    warn!(realm, error = %e, "token refresh failed, destroying session");
                    self.store.destroy(sid).await?;
                    return Err(Error::RefreshFailed);
                }
            };
            let access_token = tokens.access_token.clone();
            session.apply_tokens(tokens);
            self.store.set(sid, &session).await?;
            access_token
        } else {
            session.access_token.clone().unwrap_or_default()
        };

        let profile = self.keycloak.user_info(&realm, &access_token).await?;
        let permissions = self.keycloak.permissions(&realm, &access_token).await?;
        let url_acc = self.keycloak.build_account_url(&realm)?;

        Ok(UserInfoPayload {
            profile,
            permissions,
            tenant: realm.clone(),
            realm,
            url_acc: url_acc.into(),
        })
    }

    /// End the session: destroy it (which fires the pre-destroy hook) and
    /// return the provider's front-channel logout URL, which redirects back
    /// to `{base_url}{return_path}` when done.
    ///
    /// Without a COMPLETE session there is nothing to revoke; the user is
    /// sent straight to `{return_path}?error=There is no active session`. A
    /// PARTIAL leftover is still cleared, so an explicit logout never leaves
    /// state behind.
    pub async fn revoke(&self, sid: &str, return_path: &str) -> Result<Url, Error> {
        let Some(session) = self.store.get(sid).await? else {
            return self.return_url(return_path, "error", "There is no active session");
        };
        if session.access_token.is_none() {
            if let Err(e) = self.store.destroy(sid).await {
                warn!(realm = %session.realm, error = %e, "session destroy failed during revoke");
            }
            return self.return_url(return_path, "error", "There is no active session");
        }

        // Token revocation happens inside destroy via the pre-destroy hook.
        // A failed destroy still sends the user to the provider logout; the
        // session will be swept when its TTLs lapse.
        if let Err(e) = self.store.destroy(sid).await {
            warn!(realm = %session.realm, error = %e, "session destroy failed during revoke");
        }

        let back = self
            .base_url
            .join(return_path)
            .map_err(|e| Error::Config(format!("return path {return_path:?}: {e}")))?;
        self.keycloak.build_logout_url(&session.realm, &back)
    }

    fn return_url(&self, return_path: &str, key: &str, value: &str) -> Result<Url, Error> {
        let mut url = self
            .base_url
            .join(return_path)
            .map_err(|e| Error::Config(format!("return path {return_path:?}: {e}")))?;
        url.query_pairs_mut().append_pair(key, value);
        Ok(url)
    }
}
