//! The persisted session record.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::keycloak::TokenSet;

/// A persisted session, keyed by an opaque session id (`sid`) owned by the
/// transport layer.
///
/// A session is PARTIAL once `realm`, `code_verifier` and `return_path` are
/// set (login started), and COMPLETE only when all four token fields are also
/// present (callback finished). Field names serialize in camelCase so the
/// records stay readable by the platform's other tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Tenant identifier; also selects the identity provider realm.
    pub realm: String,

    /// PKCE verifier, set at login and consumed at callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,

    /// Post-login redirect target, relative to the gateway base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub access_token_expires_at: Option<OffsetDateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<OffsetDateTime>,

    /// Cookie attributes carried alongside the session. Transport concern:
    /// the store persists but never interprets them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<serde_json::Value>,
}

impl Session {
    /// Start a PARTIAL session at login.
    #[must_use]
    pub fn partial(
        realm: impl Into<String>,
        code_verifier: impl Into<String>,
        return_path: impl Into<String>,
    ) -> Self {
        Self {
            realm: realm.into(),
            code_verifier: Some(code_verifier.into()),
            return_path: Some(return_path.into()),
            access_token: None,
            access_token_expires_at: None,
            refresh_token: None,
            refresh_expires_at: None,
            cookie: None,
        }
    }

    /// True once login has started: `realm`, `code_verifier` and
    /// `return_path` are all present. Token fields without these are treated
    /// as invalid for the callback step.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.realm.is_empty() && self.code_verifier.is_some() && self.return_path.is_some()
    }

    /// True once the callback has merged all four token fields.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.access_token.is_some()
            && self.access_token_expires_at.is_some()
            && self.refresh_token.is_some()
            && self.refresh_expires_at.is_some()
    }

    /// Merge a token grant into the session (PARTIAL → COMPLETE, or a
    /// COMPLETE self-loop on refresh).
    pub fn apply_tokens(&mut self, tokens: TokenSet) {
        self.access_token = Some(tokens.access_token);
        self.access_token_expires_at = Some(tokens.access_token_expires_at);
        self.refresh_token = Some(tokens.refresh_token);
        self.refresh_expires_at = Some(tokens.refresh_expires_at);
    }

    /// Whether the access token has passed its stored expiry.
    ///
    /// Re-reads the wall clock at every call; a token exactly at the boundary
    /// counts as expired (closed lower bound on validity).
    #[must_use]
    pub fn access_token_expired(&self) -> bool {
        match self.access_token_expires_at {
            Some(expires_at) => OffsetDateTime::now_utc() >= expires_at,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn complete_session() -> Session {
        let mut session = Session::partial("admin", "verifier", "/");
        session.apply_tokens(TokenSet {
            access_token: "access".into(),
            access_token_expires_at: OffsetDateTime::now_utc() + Duration::minutes(5),
            refresh_token: "refresh".into(),
            refresh_expires_at: OffsetDateTime::now_utc() + Duration::hours(1),
        });
        session
    }

    #[test]
    fn partial_then_complete() {
        let session = Session::partial("admin", "verifier", "/");
        assert!(session.is_partial());
        assert!(!session.is_complete());

        let session = complete_session();
        assert!(session.is_partial());
        assert!(session.is_complete());
    }

    #[test]
    fn tokens_without_login_fields_are_not_partial() {
        let mut session = complete_session();
        session.code_verifier = None;
        session.return_path = None;
        assert!(!session.is_partial());
        assert!(session.is_complete());
    }

    #[test]
    fn expiry_boundary_is_closed() {
        let mut session = complete_session();
        assert!(!session.access_token_expired());

        session.access_token_expires_at = Some(OffsetDateTime::now_utc() - Duration::seconds(1));
        assert!(session.access_token_expired());

        session.access_token_expires_at = None;
        assert!(session.access_token_expired());
    }

    #[test]
    fn serializes_camel_case() {
        let session = complete_session();
        let json = serde_json::to_value(&session).unwrap();
        assert!(json.get("codeVerifier").is_some());
        assert!(json.get("returnPath").is_some());
        assert!(json.get("accessTokenExpiresAt").is_some());
        assert!(json.get("refreshExpiresAt").is_some());
        assert!(json.get("code_verifier").is_none());
    }

    #[test]
    fn record_roundtrip() {
        let session = complete_session();
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
