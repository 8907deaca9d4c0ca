//! Realm-keyed Keycloak client.
//!
//! Every operation takes the realm as a parameter; one client serves all
//! tenants of the platform. Paths follow the legacy Keycloak layout
//! (`/auth/realms/<realm>/...`) that the gateway's deployments run.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use url::Url;

use crate::error::Error;

/// Client for a multi-realm Keycloak instance.
pub struct KeycloakClient {
    keycloak_url: Url,
    client_id: String,
    redirect_uri: Url,
    http: reqwest::Client,
}

/// Token grant normalized for session storage: relative lifetimes from the
/// provider (`expires_in`) are resolved against the wall clock at receipt.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub access_token_expires_at: OffsetDateTime,
    pub refresh_token: String,
    pub refresh_expires_at: OffsetDateTime,
}

/// Raw token-endpoint response.
#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    expires_in: u64,
    refresh_token: String,
    #[serde(default)]
    refresh_expires_in: u64,
}

impl From<TokenGrant> for TokenSet {
    fn from(grant: TokenGrant) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            access_token: grant.access_token,
            access_token_expires_at: now + Duration::seconds(grant.expires_in as i64),
            refresh_token: grant.refresh_token,
            refresh_expires_at: now + Duration::seconds(grant.refresh_expires_in as i64),
        }
    }
}

/// Profile from the userinfo endpoint, reshaped for the gateway's clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct UserProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename(deserialize = "preferred_username", serialize = "username"))]
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(
        default,
        rename(deserialize = "email_verified", serialize = "emailVerified")
    )]
    pub email_verified: bool,
}

/// One UMA permission grant: a resource and the scopes held on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Permission {
    #[serde(alias = "rsname", rename(serialize = "resourceName"))]
    pub resource_name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl KeycloakClient {
    #[must_use]
    pub fn new(keycloak_url: Url, client_id: impl Into<String>, redirect_uri: Url) -> Self {
        Self {
            keycloak_url,
            client_id: client_id.into(),
            redirect_uri,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Authorization-endpoint URL starting the PKCE login for a realm.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the realm produces an unjoinable path.
    pub fn build_login_url(
        &self,
        realm: &str,
        state: &str,
        code_challenge: &str,
    ) -> Result<Url, Error> {
        let mut url = self.realm_endpoint(realm, "protocol/openid-connect/auth")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("scope", "openid")
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(url)
    }

    /// Front-channel logout URL; the provider redirects back to
    /// `post_logout_redirect` when done.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the realm produces an unjoinable path.
    pub fn build_logout_url(&self, realm: &str, post_logout_redirect: &Url) -> Result<Url, Error> {
        let mut url = self.realm_endpoint(realm, "protocol/openid-connect/logout")?;
        url.query_pairs_mut()
            .append_pair("redirect_uri", post_logout_redirect.as_str());
        Ok(url)
    }

    /// Account-console URL for a realm (`/auth/realms/<realm>/account`).
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the realm produces an unjoinable path.
    pub fn build_account_url(&self, realm: &str) -> Result<Url, Error> {
        self.realm_endpoint(realm, "account")
    }

    /// Exchange an authorization code for tokens (PKCE).
    ///
    /// # Errors
    ///
    /// [`Error::Http`] on network failure, [`Error::Provider`] if the token
    /// endpoint rejects the grant.
    pub async fn token_by_authorization_code(
        &self,
        realm: &str,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenSet, Error> {
        let params = [
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("code_verifier", code_verifier),
        ];
        let grant = self.token_request(realm, &params, "token exchange").await?;
        Ok(grant.into())
    }

    /// Obtain a fresh token pair from a refresh token.
    ///
    /// # Errors
    ///
    /// [`Error::Http`] on network failure, [`Error::Provider`] if the grant
    /// is rejected (expired or revoked refresh token).
    pub async fn token_by_refresh(&self, realm: &str, refresh_token: &str) -> Result<TokenSet, Error> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        let grant = self.token_request(realm, &params, "token refresh").await?;
        Ok(grant.into())
    }

    /// Fetch the profile behind an access token.
    ///
    /// # Errors
    ///
    /// [`Error::Http`] on network failure, [`Error::Provider`] if the token
    /// is not accepted.
    pub async fn user_info(&self, realm: &str, access_token: &str) -> Result<UserProfile, Error> {
        let url = self.realm_endpoint(realm, "protocol/openid-connect/userinfo")?;
        let response = self.http.get(url).bearer_auth(access_token).send().await?;
        let response = Self::ensure_success(response, "userinfo request").await?;
        response.json::<UserProfile>().await.map_err(Into::into)
    }

    /// Fetch the UMA permissions an access token carries, via the
    /// `uma-ticket` grant with `response_mode=permissions`.
    ///
    /// # Errors
    ///
    /// [`Error::Http`] on network failure, [`Error::Provider`] if the
    /// authorization request is rejected.
    pub async fn permissions(
        &self,
        realm: &str,
        access_token: &str,
    ) -> Result<Vec<Permission>, Error> {
        let url = self.realm_endpoint(realm, "protocol/openid-connect/token")?;
        let params = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:uma-ticket"),
            ("audience", self.client_id.as_str()),
            ("response_mode", "permissions"),
        ];
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .form(&params)
            .send()
            .await?;
        let response = Self::ensure_success(response, "permissions request").await?;
        response.json::<Vec<Permission>>().await.map_err(Into::into)
    }

    /// Back-channel logout, invalidating a refresh token server-side.
    ///
    /// # Errors
    ///
    /// [`Error::Http`] on network failure, [`Error::Provider`] if the
    /// provider rejects the request.
    pub async fn logout(&self, realm: &str, refresh_token: &str) -> Result<(), Error> {
        let url = self.realm_endpoint(realm, "protocol/openid-connect/logout")?;
        let params = [
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        let response = self.http.post(url).form(&params).send().await?;
        Self::ensure_success(response, "logout").await?;
        Ok(())
    }

    fn realm_endpoint(&self, realm: &str, path: &str) -> Result<Url, Error> {
        self.keycloak_url
            .join(&format!("auth/realms/{realm}/{path}"))
            .map_err(|e| Error::Config(format!("realm {realm:?}: {e}")))
    }

    async fn token_request(
        &self,
        realm: &str,
        params: &[(&str, &str)],
        operation: &'static str,
    ) -> Result<TokenGrant, Error> {
        let url = self.realm_endpoint(realm, "protocol/openid-connect/token")?;
        let response = self.http.post(url).form(params).send().await?;
        let response = Self::ensure_success(response, operation).await?;
        response.json::<TokenGrant>().await.map_err(Into::into)
    }

    /// Checks HTTP response status; returns the response on success or an
    /// error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Provider {
            operation,
            status: Some(status),
            detail: body,
        })
    }
}
