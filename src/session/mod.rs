//! Redis-backed session persistence: the dual-TTL store, its key-value
//! backend boundary, and the expired-key notification listener.

pub mod backend;
pub mod listener;
pub mod store;
pub mod types;

pub use backend::{KvBackend, RedisBackend};
pub use listener::ExpiryListener;
pub use store::{DestroyHook, SessionStore};
pub use types::Session;
