//! Key-value backend boundary.
//!
//! The store only needs the wire contract below (`GET`/`SET`/`EXPIRE`/`TTL`/
//! `DEL`); everything TTL- and notification-related is layered on top by
//! [`SessionStore`](super::store::SessionStore) and the expiry listener.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::error::Error;
use crate::health::{COMMANDS_CHECK, ServiceState};

/// Command surface of the key-value store.
///
/// Implemented by [`RedisBackend`] in production and by an in-memory fake in
/// tests. All values are strings; TTLs are in whole seconds.
pub trait KvBackend: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, Error>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Set a key's TTL. Returns `false` if the key does not exist.
    fn expire(&self, key: &str, seconds: u64) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Remaining TTL of a key, `None` if the key is missing or has no expiry.
    fn ttl(&self, key: &str) -> impl Future<Output = Result<Option<u64>, Error>> + Send;

    fn del(&self, key: &str) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Deduplicated readiness signaling for one named check: only transitions
/// reach the coordinator, not every command outcome.
struct CheckGauge {
    state: Arc<dyn ServiceState>,
    check: &'static str,
    ready: AtomicBool,
}

impl CheckGauge {
    fn new(state: Arc<dyn ServiceState>, check: &'static str) -> Self {
        Self {
            state,
            check,
            ready: AtomicBool::new(false),
        }
    }

    fn up(&self) {
        if !self.ready.swap(true, Ordering::Relaxed) {
            self.state.signal_ready(self.check);
        }
    }

    fn down(&self) {
        if self.ready.swap(false, Ordering::Relaxed) {
            self.state.signal_not_ready(self.check);
        }
    }
}

/// Connection-level failures flip the readiness check; a type or script
/// error does not mean the command path is down.
fn is_connection_error(e: &redis::RedisError) -> bool {
    e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout()
}

/// Redis command connection.
///
/// `ConnectionManager` reconnects on its own; a lost connection surfaces as
/// [`Error::StoreUnavailable`] on the next command rather than tearing the
/// process down. The `redis-pub` readiness check tracks the command path:
/// not-ready on a connection-level command failure, ready again on the next
/// success.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    gauge: Arc<CheckGauge>,
}

impl RedisBackend {
    /// Connect the command path and signal the `redis-pub` readiness check.
    ///
    /// Also enables `Ex` keyspace notifications on the server so the
    /// subscriber connection receives expired-key events.
    pub async fn connect(
        redis_url: &str,
        state: Arc<dyn ServiceState>,
    ) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = ConnectionManager::new(client).await?;

        // Expired-key events only; the listener filters for idle sentinels.
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async::<()>(&mut conn)
            .await?;

        info!(url = %redis_url, "Redis command connection established");
        let gauge = Arc::new(CheckGauge::new(state, COMMANDS_CHECK));
        gauge.up();

        Ok(Self { conn, gauge })
    }

    fn observe<T>(&self, result: Result<T, redis::RedisError>) -> Result<T, Error> {
        match result {
            Ok(value) => {
                self.gauge.up();
                Ok(value)
            }
            Err(e) => {
                if is_connection_error(&e) {
                    self.gauge.down();
                }
                Err(e.into())
            }
        }
    }
}

impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        self.observe(conn.get(key).await)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        self.observe(conn.set(key, value).await)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        self.observe(conn.expire(key, seconds as i64).await)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, Error> {
        let mut conn = self.conn.clone();
        let seconds: i64 = self.observe(conn.ttl(key).await)?;
        // -2: key missing, -1: no expiry set.
        Ok(u64::try_from(seconds).ok())
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        self.observe(conn.del(key).await)
    }
}
