/// Errors surfaced by the session store and the authentication flow.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The key-value backend could not be reached or rejected a command.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    /// A session record exists but could not be deserialized.
    #[error("corrupt session record: {0}")]
    CorruptSession(String),

    /// No session, or the session is missing the fields the operation needs.
    /// Always recoverable by re-authenticating.
    #[error("there is no valid session")]
    NoValidSession,

    /// The identity provider rejected the refresh grant. The session has
    /// been destroyed as a side effect; the user must re-authenticate.
    #[error("it was not possible to renew the token")]
    RefreshFailed,

    /// HTTP transport failure talking to the identity provider.
    #[error("identity provider unreachable: {0}")]
    Http(#[from] reqwest::Error),

    /// The identity provider answered with a non-success status.
    #[error("{operation} rejected by identity provider ({status:?}): {detail}")]
    Provider {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}
