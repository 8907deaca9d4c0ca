//! Session persistence with dual-TTL expiration.
//!
//! Each session id owns two keys:
//!
//! - `session:<sid>` — the full JSON record, TTL = absolute max lifetime,
//!   set once at creation and never extended.
//! - `session-idle:<sid>` — a fixed `"empty"` sentinel, TTL = sliding idle
//!   window, reset on activity.
//!
//! The sentinel's expiry is the signal: its keyspace notification drives
//! session teardown and the pre-destroy hook. The record's own TTL is the
//! backstop against missed notifications. The sentinel TTL is always clamped
//! below the record's remaining lifetime, so the notification fires while the
//! record (and its tokens) are still readable — a session that dies of old
//! age gets its hook invoked too, not only one that dies idle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SessionTtl;
use crate::error::Error;
use crate::session::backend::KvBackend;
use crate::session::types::Session;

const RECORD_PREFIX: &str = "session:";
const IDLE_PREFIX: &str = "session-idle:";
const IDLE_VALUE: &str = "empty";

/// Caller-supplied logic invoked with a dying session's credentials before
/// its keys are deleted. Used to revoke identity-provider tokens.
///
/// Failures are logged, never propagated: leaving an undeletable session
/// behind is worse than failing to revoke upstream tokens.
pub trait DestroyHook: Send + Sync + 'static {
    fn before_destroy(
        &self,
        realm: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;
}

/// Object-safe wrapper for DestroyHook (needed for Arc<dyn>).
trait DestroyHookDyn: Send + Sync {
    fn before_destroy_dyn<'a>(
        &'a self,
        realm: &'a str,
        access_token: &'a str,
        refresh_token: &'a str,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>
                + Send
                + 'a,
        >,
    >;
}

impl<T: DestroyHook> DestroyHookDyn for T {
    fn before_destroy_dyn<'a>(
        &'a self,
        realm: &'a str,
        access_token: &'a str,
        refresh_token: &'a str,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>
                + Send
                + 'a,
        >,
    > {
        Box::pin(self.before_destroy(realm, access_token, refresh_token))
    }
}

/// Dual-TTL session store over a [`KvBackend`].
pub struct SessionStore<B> {
    backend: B,
    ttl: SessionTtl,
    hook: Option<Arc<dyn DestroyHookDyn>>,
}

impl<B: KvBackend> SessionStore<B> {
    /// Create a store without a pre-destroy hook.
    #[must_use]
    pub fn new(backend: B, ttl: SessionTtl) -> Self {
        Self {
            backend,
            ttl,
            hook: None,
        }
    }

    /// Inject the pre-destroy hook at construction. At most one hook is
    /// supported; it cannot be rebound later.
    #[must_use]
    pub fn with_destroy_hook(mut self, hook: impl DestroyHook) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Read a session.
    ///
    /// The idle sentinel is the authoritative liveness marker: if it is gone
    /// the session is gone, and the record key is not read (tolerating record
    /// garbage not yet swept). Reading does NOT count as activity — callers
    /// decide via [`restart_idle_ttl`](Self::restart_idle_ttl).
    ///
    /// # Errors
    ///
    /// [`Error::CorruptSession`] if the record exists but cannot be
    /// deserialized; [`Error::StoreUnavailable`] on backend failure.
    pub async fn get(&self, sid: &str) -> Result<Option<Session>, Error> {
        if self.backend.get(&idle_key(sid)).await?.is_none() {
            return Ok(None);
        }
        match self.backend.get(&record_key(sid)).await? {
            Some(raw) => {
                let session = serde_json::from_str(&raw)
                    .map_err(|e| Error::CorruptSession(e.to_string()))?;
                Ok(Some(session))
            }
            None => {
                // Sentinel outlived the record (out-of-order teardown or a
                // manual flush); report the session as gone.
                debug!(sid, "idle sentinel present without a session record");
                Ok(None)
            }
        }
    }

    /// Write a session, overwriting any prior value for the same sid.
    ///
    /// The record key gets the absolute-lifetime TTL; the idle sentinel is
    /// written second so a failed sentinel write leaves at worst a dangling
    /// record bounded by that absolute TTL. No merge semantics: callers
    /// read-modify-write for partial updates.
    pub async fn set(&self, sid: &str, session: &Session) -> Result<(), Error> {
        let raw = serde_json::to_string(session)
            .map_err(|e| Error::CorruptSession(e.to_string()))?;

        let record = record_key(sid);
        self.backend.set(&record, &raw).await?;
        self.backend
            .expire(&record, self.ttl.max_life_time_secs)
            .await?;

        let idle = idle_key(sid);
        self.backend.set(&idle, IDLE_VALUE).await?;
        self.backend
            .expire(&idle, self.clamped_idle(self.ttl.max_life_time_secs))
            .await?;
        Ok(())
    }

    /// Reset the idle sentinel's TTL to a full idle window, proving liveness
    /// without rewriting the record. Call on every authenticated request
    /// that inspects a session.
    ///
    /// # Errors
    ///
    /// [`Error::NoValidSession`] if the session is already gone.
    pub async fn restart_idle_ttl(&self, sid: &str) -> Result<(), Error> {
        let Some(remaining) = self.backend.ttl(&record_key(sid)).await? else {
            return Err(Error::NoValidSession);
        };
        let extended = self
            .backend
            .expire(&idle_key(sid), self.clamped_idle(remaining))
            .await?;
        if extended { Ok(()) } else { Err(Error::NoValidSession) }
    }

    /// Destroy a session: run the pre-destroy hook if a record is found,
    /// then delete both keys.
    ///
    /// Idempotent with respect to the hook — a concurrent destroy or expiry
    /// notification for the same sid finds no record and skips it.
    pub async fn destroy(&self, sid: &str) -> Result<(), Error> {
        self.reap(sid).await
    }

    /// Handle one idle-sentinel expiry notification.
    ///
    /// Keys other than idle sentinels are ignored; for a sentinel, this runs
    /// the same read-hook-delete sequence as [`destroy`](Self::destroy).
    pub async fn on_expiration(&self, channel: &str, expired_key: &str) -> Result<(), Error> {
        let Some(sid) = idle_sid(expired_key) else {
            debug!(channel, expired_key, "ignoring expired key outside the session namespace");
            return Ok(());
        };
        debug!(channel, sid, "idle sentinel expired, destroying session");
        self.reap(sid).await
    }

    async fn reap(&self, sid: &str) -> Result<(), Error> {
        match self.backend.get(&record_key(sid)).await? {
            Some(raw) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => self.run_hook(sid, &session).await,
                Err(e) => {
                    // Still delete: an unparseable record must not pin the sid.
                    warn!(sid, error = %e, "undecodable session record at destroy");
                }
            },
            None => debug!(sid, "no session record at destroy, skipping hook"),
        }

        // DEL, not expire: deletion must not re-enter the notification path.
        // Record first so a crash in between cannot strand tokens behind a
        // live sentinel.
        self.backend.del(&record_key(sid)).await?;
        self.backend.del(&idle_key(sid)).await?;
        Ok(())
    }

    async fn run_hook(&self, sid: &str, session: &Session) {
        let (Some(hook), Some(access_token), Some(refresh_token)) = (
            self.hook.as_ref(),
            session.access_token.as_deref(),
            session.refresh_token.as_deref(),
        ) else {
            // PARTIAL sessions have nothing to revoke.
            return;
        };
        if let Err(e) = hook
            .before_destroy_dyn(&session.realm, access_token, refresh_token)
            .await
        {
            warn!(sid, realm = %session.realm, error = %e, "pre-destroy hook failed");
        }
    }

    /// Sentinel TTL: the idle window, clamped strictly below the record's
    /// remaining absolute lifetime so the expiry notification always fires
    /// while the record is still readable.
    fn clamped_idle(&self, remaining_absolute: u64) -> u64 {
        self.ttl
            .max_idle_time_secs
            .min(remaining_absolute.saturating_sub(1))
            .max(1)
    }
}

fn record_key(sid: &str) -> String {
    format!("{RECORD_PREFIX}{sid}")
}

fn idle_key(sid: &str) -> String {
    format!("{IDLE_PREFIX}{sid}")
}

/// Extract the sid from an expired idle-sentinel key name.
pub(crate) fn idle_sid(expired_key: &str) -> Option<&str> {
    expired_key.strip_prefix(IDLE_PREFIX)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::keycloak::TokenSet;
    use crate::session::backend::testing::MemoryBackend;

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl DestroyHook for Arc<RecordingHook> {
        async fn before_destroy(
            &self,
            realm: &str,
            access_token: &str,
            refresh_token: &str,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.calls.lock().unwrap().push((
                realm.to_string(),
                access_token.to_string(),
                refresh_token.to_string(),
            ));
            Ok(())
        }
    }

    struct FailingHook;

    impl DestroyHook for FailingHook {
        async fn before_destroy(
            &self,
            _realm: &str,
            _access_token: &str,
            _refresh_token: &str,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("identity provider down".into())
        }
    }

    fn ttl(life: u64, idle: u64) -> SessionTtl {
        SessionTtl {
            max_life_time_secs: life,
            max_idle_time_secs: idle,
        }
    }

    fn store_with_hook(
        backend: MemoryBackend,
        ttl: SessionTtl,
    ) -> (SessionStore<MemoryBackend>, Arc<RecordingHook>) {
        let hook = Arc::new(RecordingHook::default());
        let store = SessionStore::new(backend, ttl).with_destroy_hook(Arc::clone(&hook));
        (store, hook)
    }

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

    /// Drive every key the backend expired through the notification path,
    /// the way the listener does.
    async fn deliver_expirations(store: &SessionStore<MemoryBackend>, expired: Vec<String>) {
        for key in expired {
            store.on_expiration("__keyevent@0__:expired", &key).await.unwrap();
        }
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let backend = MemoryBackend::new();
        let store = SessionStore::new(backend, ttl(86_400, 1_800));
        let session = complete_session();

        store.set("sid", &session).await.unwrap();
        let read = store.get("sid").await.unwrap().unwrap();
        assert_eq!(read, session);
    }

    #[tokio::test]
    async fn get_absent_is_none() {
        let store = SessionStore::new(MemoryBackend::new(), ttl(86_400, 1_800));
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_does_not_read_record_behind_dead_sentinel() {
        let backend = MemoryBackend::new();
        let store = SessionStore::new(backend.clone(), ttl(86_400, 1_800));
        // Record garbage without a sentinel: must be invisible, not corrupt.
        backend.put_raw("session:sid", "{not json", None);
        assert!(store.get("sid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_record_surfaces_as_corrupt_session() {
        let backend = MemoryBackend::new();
        let store = SessionStore::new(backend.clone(), ttl(86_400, 1_800));
        backend.put_raw("session:sid", "{not json", None);
        backend.put_raw("session-idle:sid", "empty", Some(1_800));

        let err = store.get("sid").await.unwrap_err();
        assert!(matches!(err, Error::CorruptSession(_)));
    }

    #[tokio::test]
    async fn idle_expiry_fires_hook_exactly_once() {
        let backend = MemoryBackend::new();
        let (store, hook) = store_with_hook(backend.clone(), ttl(86_400, 30));
        store.set("sid", &complete_session()).await.unwrap();

        let expired = backend.advance(31);
        assert_eq!(expired, vec!["session-idle:sid".to_string()]);
        deliver_expirations(&store, expired).await;

        let calls = hook.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![("admin".to_string(), "access".to_string(), "refresh".to_string())]
        );
        assert!(!backend.contains("session:sid"));
        assert!(store.get("sid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restart_idle_ttl_keeps_session_alive() {
        let backend = MemoryBackend::new();
        let (store, hook) = store_with_hook(backend.clone(), ttl(86_400, 30));
        store.set("sid", &complete_session()).await.unwrap();

        deliver_expirations(&store, backend.advance(20)).await;
        store.restart_idle_ttl("sid").await.unwrap();
        deliver_expirations(&store, backend.advance(20)).await;

        // 40s elapsed but never 30s without activity.
        assert!(store.get("sid").await.unwrap().is_some());
        assert!(hook.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_idle_ttl_on_dead_session_is_no_valid_session() {
        let store = SessionStore::new(MemoryBackend::new(), ttl(86_400, 30));
        let err = store.restart_idle_ttl("gone").await.unwrap_err();
        assert!(matches!(err, Error::NoValidSession));
    }

    #[tokio::test]
    async fn absolute_cap_holds_and_fires_hook_despite_activity() {
        let backend = MemoryBackend::new();
        let (store, hook) = store_with_hook(backend.clone(), ttl(60, 30));
        store.set("sid", &complete_session()).await.unwrap();

        // Keep the session busy toward the absolute cap. Each restart clamps
        // the sentinel under the record's shrinking remaining lifetime.
        deliver_expirations(&store, backend.advance(25)).await;
        store.restart_idle_ttl("sid").await.unwrap();
        assert_eq!(backend.ttl_of("session-idle:sid"), Some(30));

        deliver_expirations(&store, backend.advance(25)).await;
        store.restart_idle_ttl("sid").await.unwrap();
        // 10s of record lifetime left; sentinel clamped below it.
        assert_eq!(backend.ttl_of("session-idle:sid"), Some(9));

        // The sentinel lapses first, with the record still readable.
        deliver_expirations(&store, backend.advance(9)).await;

        assert!(!backend.contains("session:sid"));
        assert!(!backend.contains("session-idle:sid"));
        assert_eq!(hook.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sentinel_expires_before_record_at_absolute_boundary() {
        let backend = MemoryBackend::new();
        let store = SessionStore::new(backend.clone(), ttl(60, 1_800));
        store.set("sid", &complete_session()).await.unwrap();

        // Idle window wider than the lifetime: sentinel clamps to life - 1.
        assert_eq!(backend.ttl_of("session-idle:sid"), Some(59));
        assert_eq!(backend.ttl_of("session:sid"), Some(60));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let backend = MemoryBackend::new();
        let (store, hook) = store_with_hook(backend, ttl(86_400, 1_800));
        store.set("sid", &complete_session()).await.unwrap();

        store.destroy("sid").await.unwrap();
        store.destroy("sid").await.unwrap();

        assert_eq!(hook.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destroy_racing_expiry_notification_runs_hook_once() {
        let backend = MemoryBackend::new();
        let (store, hook) = store_with_hook(backend, ttl(86_400, 1_800));
        store.set("sid", &complete_session()).await.unwrap();

        store.destroy("sid").await.unwrap();
        // The notification for the already-destroyed sid arrives late.
        store
            .on_expiration("__keyevent@0__:expired", "session-idle:sid")
            .await
            .unwrap();

        assert_eq!(hook.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destroy_of_partial_session_skips_hook() {
        let backend = MemoryBackend::new();
        let (store, hook) = store_with_hook(backend.clone(), ttl(86_400, 1_800));
        store
            .set("sid", &Session::partial("admin", "verifier", "/"))
            .await
            .unwrap();

        store.destroy("sid").await.unwrap();

        assert!(hook.calls.lock().unwrap().is_empty());
        assert!(!backend.contains("session:sid"));
    }

    #[tokio::test]
    async fn hook_failure_does_not_block_deletion() {
        let backend = MemoryBackend::new();
        let store =
            SessionStore::new(backend.clone(), ttl(86_400, 1_800)).with_destroy_hook(FailingHook);
        store.set("sid", &complete_session()).await.unwrap();

        store.destroy("sid").await.unwrap();

        assert!(!backend.contains("session:sid"));
        assert!(!backend.contains("session-idle:sid"));
    }

    #[tokio::test]
    async fn foreign_expired_keys_are_ignored() {
        let backend = MemoryBackend::new();
        let (store, hook) = store_with_hook(backend, ttl(86_400, 1_800));
        store.set("sid", &complete_session()).await.unwrap();

        store
            .on_expiration("__keyevent@0__:expired", "cache:something")
            .await
            .unwrap();

        assert!(hook.calls.lock().unwrap().is_empty());
        assert!(store.get("sid").await.unwrap().is_some());
    }

    #[test]
    fn idle_sid_extraction() {
        assert_eq!(idle_sid("session-idle:abc123"), Some("abc123"));
        assert_eq!(idle_sid("session:abc123"), None);
        assert_eq!(idle_sid("other"), None);
    }
}
