/// Core error type for the loan bot.
///
/// Adapter crates map their specific errors (HTTP client, Telegram transport)
/// into this type so the conversation layer can decide what the user sees.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// The backend has no record for the requested key (e.g. unregistered phone).
    #[error("not found: {0}")]
    NotFound(String),

    /// User-correctable input problem.
    #[error("{0}")]
    Validation(String),

    /// Transport failure, timeout, non-2xx status or an unreadable body.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("session expired")]
    SessionExpired,

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
